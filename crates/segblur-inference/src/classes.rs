//! Segmentation class tables.

use std::path::Path;

use tracing::debug;

use segblur_core::error::{EngineError, Result};

/// The 21 PASCAL VOC classes predicted by torchvision FCN / DeepLabV3 models.
pub const VOC_CLASSES: [&str; 21] = [
    "__background__",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

/// Ordered class names; a class's position is its output channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassTable {
    names: Vec<String>,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::pascal_voc()
    }
}

impl ClassTable {
    pub fn pascal_voc() -> Self {
        Self {
            names: VOC_CLASSES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_names(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(EngineError::Configuration("class table is empty".into()));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(EngineError::Configuration(format!(
                    "class '{name}' listed twice"
                )));
            }
        }
        Ok(Self { names })
    }

    /// Load one class name per line.  Blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read labels {}: {e}", path.display()))
        })?;
        let names = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self::from_names(names)
    }

    /// The table for `labels_path`, or PASCAL VOC when none is given.
    pub fn load(labels_path: Option<&Path>) -> Result<Self> {
        match labels_path {
            Some(path) => {
                let table = Self::from_file(path)?;
                debug!(path = %path.display(), classes = table.len(), "Loaded class labels");
                Ok(table)
            }
            None => Ok(Self::pascal_voc()),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i, n.as_str()))
    }

    /// Resolve a class name (case-insensitive) or numeric index.
    pub fn resolve(&self, selector: &str) -> Result<usize> {
        let selector = selector.trim();
        if let Some(i) = self
            .names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(selector))
        {
            return Ok(i);
        }
        if let Ok(i) = selector.parse::<usize>() {
            if i < self.names.len() {
                return Ok(i);
            }
            return Err(EngineError::Configuration(format!(
                "class index {i} out of range (table has {} classes)",
                self.names.len()
            )));
        }
        Err(EngineError::Configuration(format!(
            "unknown segmentation class '{selector}' (known: {})",
            self.names.join(", ")
        )))
    }
}
