//! Converters backed by an arbitrary external program.
//!
//! Arguments may contain `{input}` and `{output}`. Without an `{output}`
//! placeholder the program's stdout becomes the result.

use crate::core::config::CommandConverterConfig;
use crate::core::mime;
use crate::plugins::converter::write_source;
use crate::plugins::{Converter, Plugin, SourceReader};
use crate::utils::process::run_command;
use crate::{MimepackError, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CommandConverter {
    config: CommandConverterConfig,
    timeout_secs: u64,
}

impl CommandConverter {
    pub fn new(config: CommandConverterConfig, timeout_secs: u64) -> Self {
        Self { config, timeout_secs }
    }

    /// MIME types and prefixes this command was configured for.
    pub fn patterns(&self) -> &[String] {
        &self.config.mime_types
    }

    fn expand_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }

    fn writes_output_file(&self) -> bool {
        self.config.args.iter().any(|arg| arg.contains("{output}"))
    }
}

impl Plugin for CommandConverter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn initialize(&self) -> Result<()> {
        if self.config.program.trim().is_empty() {
            return Err(MimepackError::validation(format!(
                "command converter '{}' has no program",
                self.config.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(
        &self,
        cancel: &CancellationToken,
        dest: &Path,
        source: SourceReader,
        content_type: &str,
    ) -> Result<()> {
        let scratch = tempfile::Builder::new().prefix("mimepack-cmd-").tempdir()?;
        let input = scratch
            .path()
            .join(format!("input.{}", mime::extension_for(content_type)));
        let output = scratch
            .path()
            .join(format!("output.{}", mime::extension_for(&self.config.output_type)));
        write_source(&input, source).await?;

        let mut command = Command::new(&self.config.program);
        command.args(self.expand_args(&input, &output));
        let result = run_command(command, &self.config.name, self.timeout_secs, cancel).await?;

        let written = if self.writes_output_file() {
            tokio::fs::copy(&output, dest).await.map(|_| ())
        } else {
            tokio::fs::write(dest, &result.stdout).await
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(MimepackError::conversion(
                &self.config.name,
                format!("no output produced: {}", e),
            ));
        }
        Ok(())
    }

    fn output_type(&self) -> &str {
        &self.config.output_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> CommandConverterConfig {
        CommandConverterConfig {
            name: "shell".to_string(),
            mime_types: vec!["text/".to_string()],
            program: "sh".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            output_type: "application/pdf".to_string(),
        }
    }

    #[test]
    fn test_expand_args() {
        let converter = CommandConverter::new(config(&["-i", "{input}", "--out={output}"]), 5);
        let args = converter.expand_args(Path::new("/a/in.txt"), Path::new("/a/out.pdf"));
        assert_eq!(args, vec!["-i", "/a/in.txt", "--out=/a/out.pdf"]);
        assert!(converter.writes_output_file());
    }

    #[test]
    fn test_empty_program_rejected() {
        let mut cfg = config(&[]);
        cfg.program = " ".to_string();
        assert!(CommandConverter::new(cfg, 5).initialize().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_convert_via_output_file() {
        let converter = CommandConverter::new(config(&["-c", "cat \"$0\" > \"$1\"", "{input}", "{output}"]), 5);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("r.pdf");
        let source: SourceReader = Box::new(std::io::Cursor::new(b"abc".to_vec()));
        converter
            .convert(&CancellationToken::new(), &dest, source, "text/plain")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_convert_via_stdout() {
        let converter = CommandConverter::new(config(&["-c", "tr a-z A-Z < \"$0\"", "{input}"]), 5);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("r.pdf");
        let source: SourceReader = Box::new(std::io::Cursor::new(b"abc".to_vec()));
        converter
            .convert(&CancellationToken::new(), &dest, source, "text/plain")
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"ABC");
    }
}
