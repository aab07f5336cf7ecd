// src/artifact.rs
//
// Working artifact handed to a clustering backend: `<code>.csv`, pipe
// delimited, single column, header row followed by one row per name.

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const FIELD_DELIMITER: char = '|';

/// Transient input file for one code. The file is removed when the value is
/// dropped, whatever path the clustering step took.
#[derive(Debug)]
pub struct WorkingArtifact {
    path: PathBuf,
    file_name: String,
    rows: usize,
}

impl WorkingArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name used as the artifact identifier in logs and projects.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Number of data rows, header excluded.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

impl Drop for WorkingArtifact {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed working artifact {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove working artifact {}: {}", self.path.display(), e),
        }
    }
}

pub fn artifact_file_name(code: &str) -> String {
    format!("{}.csv", code)
}

/// Quotes a field when it would otherwise break the single-column layout.
/// A quoted field may span lines; the value reaches the backend unchanged.
fn encode_field(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c == FIELD_DELIMITER || c == '"' || c == '\n' || c == '\r');
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Writes `names` under `dir` as the artifact for `code`.
pub fn build_artifact(dir: &Path, code: &str, column_name: &str, names: &[String]) -> Result<WorkingArtifact> {
    if names.is_empty() {
        bail!("refusing to build an empty artifact for NCM {}", code);
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create artifact directory {}", dir.display()))?;

    let file_name = artifact_file_name(code);
    let path = dir.join(&file_name);
    let file = File::create(&path)
        .with_context(|| format!("Failed to create artifact {}", path.display()))?;

    // From here on the guard owns the file, so an I/O error below still removes it.
    let artifact = WorkingArtifact {
        path,
        file_name,
        rows: names.len(),
    };

    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", encode_field(column_name))
        .with_context(|| format!("Failed to write header to {}", artifact.file_name))?;
    for name in names {
        writeln!(writer, "{}", encode_field(name))
            .with_context(|| format!("Failed to write row to {}", artifact.file_name))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", artifact.file_name))?;

    debug!("Built artifact {} with {} rows", artifact.file_name, artifact.rows);
    Ok(artifact)
}

/// Reads the rows of an artifact back, honouring the quoting applied by
/// `build_artifact`. Returns the header and the data rows.
pub fn read_artifact(path: &Path) -> Result<(String, Vec<String>)> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read artifact {}", path.display()))?;
    let mut records = parse_records(&content)
        .with_context(|| format!("Malformed artifact {}", path.display()))?
        .into_iter();
    let header = records
        .next()
        .with_context(|| format!("Artifact {} has no header row", path.display()))?;
    Ok((header, records.collect()))
}

/// Splits single-column content into records. Quoted records may contain
/// line breaks, delimiters and doubled quotes.
fn parse_records(content: &str) -> Result<Vec<String>> {
    let mut records = Vec::new();
    let mut chars = content.chars().peekable();

    while chars.peek().is_some() {
        let mut field = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    Some('"') => break,
                    Some(c) => field.push(c),
                    None => bail!("unterminated quoted field in record {}", records.len() + 1),
                }
            }
            match chars.next() {
                None | Some('\n') => {}
                Some('\r') if chars.peek() == Some(&'\n') => {
                    chars.next();
                }
                Some(c) => bail!("unexpected '{}' after quoted field in record {}", c, records.len() + 1),
            }
        } else {
            for c in chars.by_ref() {
                if c == '\n' {
                    break;
                }
                field.push(c);
            }
            if field.ends_with('\r') {
                field.pop();
            }
        }
        records.push(field);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_writes_header_and_rows_in_order() {
        let dir = tempdir().unwrap();
        let artifact = build_artifact(
            dir.path(),
            "1001",
            "NOME",
            &names(&["Parafuso 3mm", "parafuso 3mm", "Parafuso 3mm", "Prego 1,5pol"]),
        )
        .unwrap();

        assert_eq!(artifact.file_name(), "1001.csv");
        assert_eq!(artifact.rows(), 4);
        let content = fs::read_to_string(artifact.path()).unwrap();
        assert_eq!(content, "NOME\nParafuso 3mm\nparafuso 3mm\nParafuso 3mm\nPrego 1,5pol\n");
    }

    #[test]
    fn test_pipes_and_quotes_are_escaped() {
        let dir = tempdir().unwrap();
        let artifact = build_artifact(
            dir.path(),
            "42",
            "NOME",
            &names(&["Cabo 2|3 \"flex\"", "linha\nquebrada", "Serrote"]),
        )
        .unwrap();

        let content = fs::read_to_string(artifact.path()).unwrap();
        assert_eq!(
            content,
            "NOME\n\"Cabo 2|3 \"\"flex\"\"\"\n\"linha\nquebrada\"\nSerrote\n"
        );

        let (header, rows) = read_artifact(artifact.path()).unwrap();
        assert_eq!(header, "NOME");
        assert_eq!(rows, names(&["Cabo 2|3 \"flex\"", "linha\nquebrada", "Serrote"]));
    }

    #[test]
    fn test_line_breaks_and_blank_names_survive_read_back() {
        let dir = tempdir().unwrap();
        let input = names(&["Cabo\r\nflex", "", "\"", "fim\n"]);
        let artifact = build_artifact(dir.path(), "8", "NOME", &input).unwrap();

        let (_, rows) = read_artifact(artifact.path()).unwrap();
        assert_eq!(rows, input);
    }

    #[test]
    fn test_unterminated_quote_is_rejected() {
        assert!(parse_records("NOME\n\"aberto\n").is_err());
        assert_eq!(parse_records("NOME\r\nPrego\r\n").unwrap(), names(&["NOME", "Prego"]));
    }

    #[test]
    fn test_file_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = {
            let artifact = build_artifact(dir.path(), "7", "NOME", &names(&["a"])).unwrap();
            assert!(artifact.path().exists());
            artifact.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(build_artifact(dir.path(), "2002", "NOME", &[]).is_err());
        assert!(!dir.path().join("2002.csv").exists());
    }
}
