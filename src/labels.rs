use serde::Serialize;
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("Failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
    #[error("Labels file is empty")]
    Empty,
}

/// Display name and drawing colour for one model class. The position in the
/// label table is the class id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassLabel {
    pub label: String,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl ClassLabel {
    pub fn unknown(class_id: usize) -> Self {
        Self {
            label: format!("class_{}", class_id),
            red: 128,
            green: 128,
            blue: 128,
        }
    }

    pub fn rgb(&self) -> [u8; 3] {
        [self.red, self.green, self.blue]
    }
}

pub fn load_labels(filepath: &Path) -> Result<Vec<ClassLabel>, LabelsError> {
    let file = File::open(filepath)?;
    parse_labels(io::BufReader::new(file))
}

pub fn parse_labels<R: BufRead>(reader: R) -> Result<Vec<ClassLabel>, LabelsError> {
    let mut color_labels = Vec::new();

    for (index, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let line_number = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != 4 {
            return Err(LabelsError::InvalidLine {
                line: line_number,
                reason: format!("expected `label,red,green,blue`, got `{}`", line),
            });
        }

        let channel = |value: &str, name: &str| -> Result<u8, LabelsError> {
            value.trim().parse().map_err(|_| LabelsError::InvalidLine {
                line: line_number,
                reason: format!("invalid {} value `{}`", name, value.trim()),
            })
        };

        color_labels.push(ClassLabel {
            label: parts[0].trim().to_string(),
            red: channel(parts[1], "red")?,
            green: channel(parts[2], "green")?,
            blue: channel(parts[3], "blue")?,
        });
    }

    if color_labels.is_empty() {
        return Err(LabelsError::Empty);
    }

    Ok(color_labels)
}
