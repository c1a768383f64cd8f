//! Document classification
//!
//! Assigns a coarse [`Category`] from a document's location and text.
//! Directory rules are consulted first (nearest directory wins), then keyword
//! phrases are scored against the content. Only directories at or below the
//! watched root count as rules.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::config::ClassifierConfig;
use crate::Category;

// ============================================================================
// Rules
// ============================================================================

/// Raw classification rules, before compilation
#[derive(Debug, Clone)]
pub struct ClassifierRules {
    /// Directory name (lowercase) to category
    pub directories: HashMap<String, Category>,

    /// Keyword phrases per category, in tie-break priority order
    pub keywords: Vec<(Category, Vec<String>)>,
}

impl ClassifierRules {
    /// Rules using the given directory mapping and the default keyword set
    pub fn from_config(config: &ClassifierConfig) -> Self {
        let directories = config
            .directories
            .iter()
            .map(|(name, category)| (name.to_lowercase(), *category))
            .collect();

        Self {
            directories,
            keywords: default_keywords(),
        }
    }

    /// Add or replace a directory rule
    pub fn with_directory(mut self, name: &str, category: Category) -> Self {
        self.directories.insert(name.to_lowercase(), category);
        self
    }
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}

fn default_keywords() -> Vec<(Category, Vec<String>)> {
    let table: [(Category, &[&str]); 4] = [
        (
            Category::JobDescription,
            &[
                "job title",
                "job description",
                "requirements:",
                "responsibilities",
                "qualifications",
                "we are looking for",
                "years of experience",
                "apply now",
                "about the role",
            ],
        ),
        (
            Category::Cv,
            &[
                "curriculum vitae",
                "resume",
                "work experience",
                "employment history",
                "professional summary",
                "education",
                "references available",
            ],
        ),
        (
            Category::SkillProfile,
            &[
                "expertise",
                "skills",
                "proficiency",
                "proficient in",
                "certifications",
                "competencies",
                "tech stack",
            ],
        ),
        (
            Category::Note,
            &[
                "learning",
                "goals",
                "transition",
                "today i",
                "reflection",
                "notes",
            ],
        ),
    ];

    table
        .into_iter()
        .map(|(category, phrases)| {
            (
                category,
                phrases.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            )
        })
        .collect()
}

// ============================================================================
// Classifier
// ============================================================================

/// Deterministic, side-effect free document classifier
#[derive(Debug, Clone)]
pub struct Classifier {
    directories: HashMap<String, Category>,
    keywords: Vec<(Category, Vec<Regex>)>,
    roots: Vec<PathBuf>,
}

impl Classifier {
    /// Compile a classifier from rules
    pub fn new(rules: ClassifierRules) -> Self {
        let keywords = rules
            .keywords
            .into_iter()
            .map(|(category, phrases)| {
                let patterns = phrases
                    .iter()
                    .filter_map(|phrase| phrase_pattern(phrase))
                    .collect();
                (category, patterns)
            })
            .collect();

        Self {
            directories: rules.directories,
            keywords,
            roots: Vec::new(),
        }
    }

    /// Classifier from configuration
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(ClassifierRules::from_config(config))
    }

    /// Limit directory rules to the given watched roots
    ///
    /// Roots are canonicalized when they exist, to match file identities.
    pub fn with_roots<I, P>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.roots = roots
            .into_iter()
            .map(|root| {
                let root = root.as_ref();
                root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
            })
            .collect();
        self
    }

    /// Classify a document by its path and extracted text
    pub fn classify(&self, path: &Path, text: &str) -> Category {
        if text.trim().is_empty() {
            return Category::Unknown;
        }

        if let Some(category) = self.category_for_path(path) {
            return category;
        }

        self.category_for_content(text).unwrap_or(Category::Unknown)
    }

    /// Category of the nearest enclosing directory that has a rule
    ///
    /// The walk stops at the innermost watched root containing the path,
    /// which is itself considered. Paths outside every root see all ancestors.
    pub fn category_for_path(&self, path: &Path) -> Option<Category> {
        let parent = path.parent()?;
        let root = self
            .roots
            .iter()
            .filter(|root| parent.starts_with(root))
            .max_by_key(|root| root.components().count());

        for dir in parent.ancestors() {
            let name = dir.file_name()?;
            if let Some(category) = self.directories.get(&name.to_string_lossy().to_lowercase()) {
                return Some(*category);
            }
            if root.is_some_and(|root| dir == root.as_path()) {
                break;
            }
        }
        None
    }

    /// Best keyword match for the text, if any phrase matched
    pub fn category_for_content(&self, text: &str) -> Option<Category> {
        let mut best: Option<(Category, usize)> = None;

        for (category, patterns) in &self.keywords {
            let score = patterns.iter().filter(|p| p.is_match(text)).count();
            // Strictly greater keeps the earlier (higher priority) category on ties
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((*category, score));
            }
        }

        best.map(|(category, _)| category)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(ClassifierRules::default())
    }
}

/// Case-insensitive phrase pattern anchored at word boundaries
fn phrase_pattern(phrase: &str) -> Option<Regex> {
    let phrase = phrase.trim();
    if phrase.is_empty() {
        return None;
    }

    let mut pattern = String::from("(?i)");
    if phrase.starts_with(|c: char| c.is_alphanumeric()) {
        pattern.push_str(r"\b");
    }
    pattern.push_str(&regex::escape(phrase));
    if phrase.ends_with(|c: char| c.is_alphanumeric()) {
        pattern.push_str(r"\b");
    }

    Regex::new(&pattern).ok()
}
