use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};

use agmai_core::error::AgmaiError;

pub const DEFAULT_PERSONA_NAME: &str = "Assistant";
const DEFAULT_PERSONA_PROMPT: &str = "You are a helpful, concise assistant. Answer in the \
language the user writes in.";

#[derive(Debug, Clone)]
pub struct Persona {
    pub name: String,
    pub category: String,
    pub prompt: String,
}

/// Built-in persona library, loaded from a directory of prompt files. Each
/// subdirectory is a category; each `.txt` file inside it is one persona whose
/// file stem is the display name.
pub struct PersonaCatalog {
    by_name: BTreeMap<String, Persona>,
}

impl PersonaCatalog {
    pub fn load(dir: &str) -> Self {
        let mut by_name = BTreeMap::new();
        by_name.insert(
            DEFAULT_PERSONA_NAME.to_string(),
            Persona {
                name: DEFAULT_PERSONA_NAME.to_string(),
                category: "general".to_string(),
                prompt: DEFAULT_PERSONA_PROMPT.to_string(),
            },
        );

        if let Err(e) = load_dir(Path::new(dir), &mut by_name) {
            warn!("Failed to load personas from {dir}: {e}");
        }
        info!("Persona catalog loaded: {} personas", by_name.len());
        PersonaCatalog { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&Persona> {
        self.by_name.get(name)
    }

    pub fn default_persona(&self) -> &Persona {
        self.by_name
            .get(DEFAULT_PERSONA_NAME)
            .unwrap_or_else(|| unreachable!("default persona inserted in load"))
    }

    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self
            .by_name
            .values()
            .map(|p| p.category.clone())
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }

    pub fn in_category(&self, category: &str) -> Vec<&Persona> {
        self.by_name
            .values()
            .filter(|p| p.category == category)
            .collect()
    }
}

fn load_dir(dir: &Path, by_name: &mut BTreeMap<String, Persona>) -> Result<(), AgmaiError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            let category = entry.file_name().to_string_lossy().to_string();
            load_category(&path, &category, by_name)?;
        } else {
            load_persona_file(&path, "general", by_name)?;
        }
    }
    Ok(())
}

fn load_category(
    dir: &Path,
    category: &str,
    by_name: &mut BTreeMap<String, Persona>,
) -> Result<(), AgmaiError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        load_persona_file(&path, category, by_name)?;
    }
    Ok(())
}

fn load_persona_file(
    path: &Path,
    category: &str,
    by_name: &mut BTreeMap<String, Persona>,
) -> Result<(), AgmaiError> {
    if path.extension().and_then(|s| s.to_str()) != Some("txt") {
        return Ok(());
    }
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return Ok(());
    };
    let prompt = std::fs::read_to_string(path)?;
    let prompt = prompt.trim();
    if prompt.is_empty() {
        warn!("Skipping empty persona file {}", path.display());
        return Ok(());
    }
    by_name.insert(
        stem.to_string(),
        Persona {
            name: stem.to_string(),
            category: category.to_string(),
            prompt: prompt.to_string(),
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dir_still_has_default() {
        let catalog = PersonaCatalog::load("/nonexistent/personas");
        assert!(catalog.get(DEFAULT_PERSONA_NAME).is_some());
        assert_eq!(catalog.categories(), vec!["general".to_string()]);
    }

    #[test]
    fn test_loads_categories_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let creative = dir.path().join("creative");
        std::fs::create_dir(&creative).unwrap();
        std::fs::write(creative.join("Poet.txt"), "You write verse.\n").unwrap();
        std::fs::write(dir.path().join("Tutor.txt"), "You teach.").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let catalog = PersonaCatalog::load(dir.path().to_str().unwrap());
        let poet = catalog.get("Poet").unwrap();
        assert_eq!(poet.category, "creative");
        assert_eq!(poet.prompt, "You write verse.");
        assert_eq!(catalog.get("Tutor").unwrap().category, "general");
        assert!(catalog.get("notes").is_none());
        assert_eq!(
            catalog.categories(),
            vec!["creative".to_string(), "general".to_string()]
        );
        assert_eq!(catalog.in_category("creative").len(), 1);
    }

    #[test]
    fn test_empty_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Empty.txt"), "   \n").unwrap();
        let catalog = PersonaCatalog::load(dir.path().to_str().unwrap());
        assert!(catalog.get("Empty").is_none());
    }
}
