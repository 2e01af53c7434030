//! Monitored-label classification.
//!
//! Each monitored category owns a keyword set. A detection label belongs to the
//! first category with a keyword occurring in it (case-insensitive substring), so
//! `Handgun` falls under a category listing `gun`.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized alert category name (e.g. `firearm`, `blade`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct CategoryClassifier {
    rules: Vec<(Category, Regex)>,
}

impl CategoryClassifier {
    /// Build from `(category, keywords)` pairs; order decides precedence.
    pub fn new(categories: &[(String, Vec<String>)]) -> Result<Self> {
        let mut rules = Vec::with_capacity(categories.len());
        for (name, keywords) in categories {
            let alternation = keywords
                .iter()
                .map(|k| k.trim())
                .filter(|k| !k.is_empty())
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join("|");
            if alternation.is_empty() {
                return Err(anyhow!("category '{}' has no keywords", name));
            }
            let re = Regex::new(&format!("(?i)(?:{})", alternation))
                .with_context(|| format!("build keyword matcher for '{}'", name))?;
            rules.push((Category::new(name.as_str()), re));
        }
        if rules.is_empty() {
            return Err(anyhow!("at least one monitored category is required"));
        }
        Ok(Self { rules })
    }

    /// Category of a detection label, or `None` when the label is not monitored.
    pub fn classify(&self, label: &str) -> Option<Category> {
        self.rules
            .iter()
            .find(|(_, re)| re.is_match(label))
            .map(|(category, _)| category.clone())
    }

    /// True when `category` names one of the monitored categories.
    pub fn is_monitored(&self, category: &str) -> bool {
        self.rules
            .iter()
            .any(|(c, _)| c.as_str().eq_ignore_ascii_case(category))
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.rules.iter().map(|(c, _)| c)
    }
}
