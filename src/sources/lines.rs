use crate::error::{AppError, Result};
use crate::pipeline::message::Message;
use super::Source;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

/// Newline-delimited input; each non-blank line becomes one message.
pub struct LinesSource<R> {
    lines: Lines<R>,
    name: String,
}

impl<R> LinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            lines: reader.lines(),
            name: name.into(),
        }
    }
}

impl LinesSource<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), "stdin")
    }
}

impl LinesSource<BufReader<tokio::fs::File>> {
    pub async fn open(path: &str) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| AppError::Config(format!("Failed to open input file {}: {}", path, e)))?;

        tracing::info!("Reading messages from {}", path);
        Ok(Self::new(BufReader::new(file), path))
    }
}

#[async_trait::async_trait]
impl<R> Source for LinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next(&mut self) -> Result<Option<Message>> {
        // next_line is cancel safe
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Ok(Some(Message::from_line(&line))),
                Ok(None) => return Ok(None),
                Err(e) => {
                    return Err(AppError::Source(format!("Failed to read from {}: {}", self.name, e)))
                }
            }
        }
    }

    async fn close(&mut self) {
        tracing::debug!("Closed line source {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_lines_and_skips_blanks() {
        let input: &[u8] = b"{\"level\":\"warn\"}\n\nplain text\n";
        let mut source = LinesSource::new(input, "memory");

        let first = source.next().await.unwrap().unwrap();
        assert_eq!(first.get("level"), Some(&json!("warn")));

        let second = source.next().await.unwrap().unwrap();
        assert_eq!(second.get("message"), Some(&json!("plain text")));

        assert!(source.next().await.unwrap().is_none());
    }
}
