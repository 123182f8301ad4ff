//! Versioned keyword tables for confidence scoring.
//!
//! Tables are plain data so scoring can evolve without code changes. Every
//! assessment records the table version it was computed against.

use serde::{Deserialize, Serialize};

/// Weight class of a keyword group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WeightClass {
    /// Domain terms (infrastructure, security, cloud)
    High,
    /// Operational terms (testing, monitoring, maintenance)
    Medium,
}

/// Per-keyword weight for each class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightTable {
    pub high: f64,
    pub medium: f64,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            high: 0.30,
            medium: 0.10,
        }
    }
}

impl WeightTable {
    pub fn weight_of(&self, class: WeightClass) -> f64 {
        match class {
            WeightClass::High => self.high,
            WeightClass::Medium => self.medium,
        }
    }
}

/// A named keyword group. The group's category is what a task is labelled
/// with when this group carries the most matched weight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordGroup {
    pub category: String,
    pub class: WeightClass,
    pub keywords: Vec<String>,
}

impl KeywordGroup {
    pub fn new(category: &str, class: WeightClass, keywords: &[&str]) -> Self {
        Self {
            category: category.to_string(),
            class,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// The full keyword configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeywordTables {
    /// Table version, recorded on every assessment
    pub version: String,

    /// Category precedence for breaking weight ties (first wins)
    pub precedence: Vec<String>,

    pub weights: WeightTable,

    pub groups: Vec<KeywordGroup>,
}

impl Default for KeywordTables {
    fn default() -> Self {
        Self {
            version: "2024.1".to_string(),
            precedence: vec![
                "infrastructure".to_string(),
                "security".to_string(),
                "cloud".to_string(),
                "development".to_string(),
                "operations".to_string(),
                "other".to_string(),
            ],
            weights: WeightTable::default(),
            groups: vec![
                KeywordGroup::new(
                    "infrastructure",
                    WeightClass::High,
                    &[
                        "infrastructure",
                        "kubernetes",
                        "k8s",
                        "helm",
                        "terraform",
                        "ansible",
                        "docker",
                        "container",
                        "deploy",
                        "deployment",
                        "cluster",
                        "nginx",
                        "server",
                    ],
                ),
                KeywordGroup::new(
                    "security",
                    WeightClass::High,
                    &[
                        "security",
                        "vulnerability",
                        "cve",
                        "firewall",
                        "audit",
                        "penetration",
                        "encryption",
                        "ssl",
                        "tls",
                        "certificate",
                        "scan",
                        "compliance",
                    ],
                ),
                KeywordGroup::new(
                    "cloud",
                    WeightClass::High,
                    &[
                        "cloud", "aws", "azure", "gcp", "s3", "ec2", "lambda", "iam", "vpc",
                    ],
                ),
                KeywordGroup::new(
                    "development",
                    WeightClass::Medium,
                    &[
                        "test", "tests", "testing", "build", "compile", "refactor", "debug",
                        "lint", "code",
                    ],
                ),
                KeywordGroup::new(
                    "operations",
                    WeightClass::Medium,
                    &[
                        "monitor",
                        "monitoring",
                        "maintenance",
                        "backup",
                        "logs",
                        "cleanup",
                        "upgrade",
                        "patch",
                        "alert",
                    ],
                ),
            ],
        }
    }
}

impl KeywordTables {
    /// Rank of a category in the precedence list; unknown categories sort last.
    pub fn precedence_rank(&self, category: &str) -> usize {
        self.precedence
            .iter()
            .position(|c| c == category)
            .unwrap_or(self.precedence.len())
    }

    /// Weight of a single keyword in the given class.
    pub fn weight_of(&self, class: WeightClass) -> f64 {
        self.weights.weight_of(class)
    }

    /// Total number of keywords across all groups.
    pub fn keyword_count(&self) -> usize {
        self.groups.iter().map(|g| g.keywords.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables_have_all_groups() {
        let tables = KeywordTables::default();
        let categories: Vec<&str> = tables.groups.iter().map(|g| g.category.as_str()).collect();
        assert_eq!(
            categories,
            vec!["infrastructure", "security", "cloud", "development", "operations"]
        );
        assert!(tables.keyword_count() > 30);
    }

    #[test]
    fn test_precedence_rank() {
        let tables = KeywordTables::default();
        assert_eq!(tables.precedence_rank("infrastructure"), 0);
        assert!(tables.precedence_rank("security") < tables.precedence_rank("cloud"));
        assert_eq!(tables.precedence_rank("made_up"), tables.precedence.len());
    }

    #[test]
    fn test_tables_parse_from_toml() {
        let raw = r#"
            version = "custom-7"
            precedence = ["db"]

            [weights]
            high = 0.5
            medium = 0.2

            [[groups]]
            category = "db"
            class = "high"
            keywords = ["postgres", "mysql"]
        "#;

        let tables: KeywordTables = toml::from_str(raw).unwrap();
        assert_eq!(tables.version, "custom-7");
        assert_eq!(tables.groups.len(), 1);
        assert_eq!(tables.weight_of(WeightClass::High), 0.5);
        assert_eq!(tables.groups[0].class, WeightClass::High);
    }
}
