use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one newline-terminated line and strips the terminator (`\n` or `\r\n`).
///
/// Returns `Ok(None)` on a clean end of stream. A trailing fragment without a
/// newline means the peer went away mid-line, which is reported as an error
/// rather than handed out as a partial message.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }

    let Some(stripped) = line.strip_suffix('\n') else {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed in the middle of a line",
        ));
    };
    let stripped = stripped.strip_suffix('\r').unwrap_or(stripped);

    Ok(Some(stripped.to_string()))
}

/// Writes `line` followed by `\n` as a single buffer, then flushes.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_lines_with_either_terminator() {
        let input: &[u8] = b"alice: hi\r\nbob: yo\n\n";
        let mut reader = BufReader::new(input);

        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("alice: hi"));
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("bob: yo"));
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some(""));
        assert_eq!(read_line(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unterminated_line_at_eof_is_an_error() {
        let input: &[u8] = b"half a mess";
        let mut reader = BufReader::new(input);

        let err = read_line(&mut reader).await.expect_err("partial line");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_error() {
        let input: &[u8] = b"\xff\xfe\n";
        let mut reader = BufReader::new(input);

        assert!(read_line(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn write_appends_newline() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut reader = BufReader::new(reader);

        write_line(&mut writer, "SERVER: alice has entered the chat!")
            .await
            .expect("write line");
        let line = read_line(&mut reader)
            .await
            .expect("read line")
            .expect("expected a line");

        assert_eq!(line, "SERVER: alice has entered the chat!");
    }
}
