//! Lines the server itself originates.

pub fn entered(username: &str) -> String {
    format!("SERVER: {username} has entered the chat!")
}

pub fn left(username: &str) -> String {
    format!("SERVER: {username} has left the chat!")
}
