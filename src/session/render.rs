use super::state::TranscriptEntry;
use crate::executor::{ExecutionOutput, ImageFormat, OutputTag};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Fenced block showing code as it streams in
pub fn code_block(language: &str, code: &str) -> String {
    format!("\n```{language}\n{code}\n```")
}

pub fn image_markup(path: &Path) -> String {
    format!(
        "<img src=\"file={}\" style='width: 600px; max-width:none; max-height:none'>",
        path.display()
    )
}

/// Transcript entries for the result of a function call: one terminal block
/// with all text items, followed by one entry per image.
///
/// Images that fail to decode or persist are logged and left out.
pub fn function_output_entries(
    output: &ExecutionOutput,
    images: &mut ImageCache,
) -> Vec<TranscriptEntry> {
    let mut text = Vec::new();
    let mut error_occurred = false;
    let mut pending_images = Vec::new();

    for item in &output.display {
        if item.tag.is_text() {
            text.push(item.payload.as_str());
        } else if let Some(format) = item.tag.image_format() {
            pending_images.push((format, item.payload.as_str()));
        } else if item.tag == OutputTag::Error {
            error_occurred = true;
        }
    }

    let text = text.join("\n");
    let text = text.trim_matches('\n');
    let terminal = if error_occurred {
        format!("❌Terminal output:\n```shell\n\n{text}\n```")
    } else {
        format!("✔️Terminal output:\n```shell\n{text}\n```")
    };

    let mut entries = vec![TranscriptEntry::assistant(terminal)];
    for (format, payload) in pending_images {
        match images.store(format, payload) {
            Ok(path) => entries.push(TranscriptEntry::assistant(image_markup(&path))),
            Err(e) => warn!("Skipping image output: {:#}", e),
        }
    }
    entries
}

/// Per-session directory for decoded image outputs
#[derive(Debug)]
pub struct ImageCache {
    dir: PathBuf,
    next_index: usize,
}

impl ImageCache {
    pub fn new(root: &Path, session_id: &str) -> Self {
        Self {
            dir: root.join(format!("temp_{session_id}")),
            next_index: 0,
        }
    }

    /// Cache located under the user's cache directory
    pub fn for_session(session_id: &str) -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("synapse-chat");
        Self::new(&root, session_id)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store(&mut self, format: ImageFormat, payload: &str) -> Result<PathBuf> {
        let bytes = STANDARD
            .decode(payload.trim())
            .context("image payload is not valid base64")?;

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self
            .dir
            .join(format!("{}.{}", self.next_index, format.extension()));
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.next_index += 1;

        debug!("Stored image output at {}", path.display());
        Ok(path)
    }

    /// Removes all images stored for this session
    pub fn clear(&mut self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)
                .with_context(|| format!("failed to remove {}", self.dir.display()))?;
        }
        self.next_index = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DisplayItem;
    use tempfile::TempDir;

    fn output(items: Vec<DisplayItem>) -> ExecutionOutput {
        ExecutionOutput {
            text_for_model: String::new(),
            display: items,
        }
    }

    #[test]
    fn test_code_block() {
        assert_eq!(code_block("python", "print(1)"), "\n```python\nprint(1)\n```");
    }

    #[test]
    fn test_successful_terminal_output() {
        let dir = TempDir::new().unwrap();
        let mut images = ImageCache::new(dir.path(), "abc");
        let entries = function_output_entries(
            &output(vec![
                DisplayItem::new(OutputTag::Stdout, "1\n"),
                DisplayItem::new(OutputTag::ExecuteResultText, "2"),
            ]),
            &mut images,
        );
        assert_eq!(
            entries,
            vec![TranscriptEntry::assistant(
                "✔️Terminal output:\n```shell\n1\n\n2\n```"
            )]
        );
    }

    #[test]
    fn test_error_marks_terminal_output() {
        let dir = TempDir::new().unwrap();
        let mut images = ImageCache::new(dir.path(), "abc");
        let entries = function_output_entries(
            &output(vec![
                DisplayItem::new(OutputTag::Stdout, "partial\n"),
                DisplayItem::new(OutputTag::Error, "Traceback"),
            ]),
            &mut images,
        );
        assert_eq!(
            entries[0].assistant.as_deref(),
            Some("❌Terminal output:\n```shell\n\npartial\n```")
        );
    }

    #[test]
    fn test_images_are_persisted_and_embedded() {
        let dir = TempDir::new().unwrap();
        let mut images = ImageCache::new(dir.path(), "abc");
        let png = STANDARD.encode([0x89, b'P', b'N', b'G']);
        let jpeg = STANDARD.encode([0xff, 0xd8]);

        let entries = function_output_entries(
            &output(vec![
                DisplayItem::new(OutputTag::DisplayPng, png),
                DisplayItem::new(OutputTag::ExecuteResultJpeg, jpeg),
                DisplayItem::new(OutputTag::DisplayPng, "%%% not base64"),
            ]),
            &mut images,
        );

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].assistant.as_deref(), Some("✔️Terminal output:\n```shell\n\n```"));

        let png_path = images.dir().join("0.png");
        assert_eq!(std::fs::read(&png_path).unwrap(), vec![0x89, b'P', b'N', b'G']);
        assert_eq!(
            entries[1].assistant.as_deref(),
            Some(image_markup(&png_path).as_str())
        );
        assert!(entries[2]
            .assistant
            .as_deref()
            .unwrap()
            .contains("temp_abc/1.jpg"));

        images.clear().unwrap();
        assert!(!images.dir().exists());
    }
}
