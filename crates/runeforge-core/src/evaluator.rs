//! Confidence scoring.
//!
//! The evaluator is a pure function of the task text, priority, category hint
//! and the configured keyword tables. Tables are iterated in declaration order
//! so the floating point sum is reproducible for identical inputs.

use crate::types::{Category, Task, TaskId, TaskPriority, OTHER_CATEGORY, UNKNOWN_CATEGORY};
use runeforge_config::{KeywordTables, ScoringConfig, WeightClass};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Keyword matches for one group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSignal {
    pub category: Category,
    pub class: WeightClass,
    pub matched: Vec<String>,
    pub weight: f64,
}

/// Contributing signals of an assessment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalBreakdown {
    /// Distinct high-signal keywords matched
    pub high_matches: usize,

    /// Distinct medium-signal keywords matched
    pub medium_matches: usize,

    /// Per-group matches, in table order (groups with no match omitted)
    pub groups: Vec<GroupSignal>,

    /// Sum of matched keyword weights before adjustments
    pub raw_score: f64,
}

impl SignalBreakdown {
    pub fn has_matches(&self) -> bool {
        self.high_matches + self.medium_matches > 0
    }
}

/// Adjustments applied on top of the keyword signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Adjustments {
    pub category_bonus: f64,
    pub priority_penalty: f64,
}

/// Result of scoring a task. Immutable once computed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceAssessment {
    pub task_id: TaskId,
    pub score: f64,
    pub category: Category,
    pub signals: SignalBreakdown,
    pub adjustments: Adjustments,
    /// Version of the keyword tables used
    pub table_version: String,
}

/// Scores task descriptions against versioned keyword tables.
#[derive(Debug, Clone)]
pub struct ConfidenceEvaluator {
    tables: KeywordTables,
    scoring: ScoringConfig,
}

impl ConfidenceEvaluator {
    pub fn new(tables: KeywordTables, scoring: ScoringConfig) -> Self {
        Self { tables, scoring }
    }

    pub fn tables(&self) -> &KeywordTables {
        &self.tables
    }

    /// Assess a task.
    pub fn assess(&self, task: &Task) -> ConfidenceAssessment {
        self.assess_parts(
            &task.task_id,
            &task.description,
            task.category_hint.as_deref(),
            task.priority,
        )
    }

    /// Assess raw task fields.
    pub fn assess_parts(
        &self,
        task_id: &str,
        description: &str,
        category_hint: Option<&str>,
        priority: TaskPriority,
    ) -> ConfidenceAssessment {
        if description.trim().is_empty() {
            return self.unscored(task_id, UNKNOWN_CATEGORY.to_string(), SignalBreakdown::default());
        }

        let tokens = tokenize(description);
        let signals = self.collect_signals(&tokens);

        if !signals.has_matches() {
            let category = category_hint
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| OTHER_CATEGORY.to_string());
            return self.unscored(task_id, category, signals);
        }

        let category = self.pick_category(&signals);
        let adjustments = Adjustments {
            category_bonus: self
                .scoring
                .category_bonus
                .get(&category)
                .copied()
                .unwrap_or(0.0),
            priority_penalty: if priority.is_high_stakes() {
                self.scoring.high_priority_penalty
            } else {
                0.0
            },
        };

        let score = (signals.raw_score + adjustments.category_bonus - adjustments.priority_penalty)
            .clamp(0.0, 1.0);

        ConfidenceAssessment {
            task_id: task_id.to_string(),
            score,
            category,
            signals,
            adjustments,
            table_version: self.tables.version.clone(),
        }
    }

    fn unscored(
        &self,
        task_id: &str,
        category: Category,
        signals: SignalBreakdown,
    ) -> ConfidenceAssessment {
        ConfidenceAssessment {
            task_id: task_id.to_string(),
            score: 0.0,
            category,
            signals,
            adjustments: Adjustments::default(),
            table_version: self.tables.version.clone(),
        }
    }

    fn collect_signals(&self, tokens: &HashSet<String>) -> SignalBreakdown {
        let mut seen: HashSet<String> = HashSet::new();
        let mut breakdown = SignalBreakdown::default();

        for group in &self.tables.groups {
            let weight_each = self.tables.weight_of(group.class);
            let mut matched = Vec::new();

            for keyword in &group.keywords {
                let keyword = keyword.to_ascii_lowercase();
                if tokens.contains(&keyword) && seen.insert(keyword.clone()) {
                    matched.push(keyword);
                }
            }

            if matched.is_empty() {
                continue;
            }

            let weight = weight_each * matched.len() as f64;
            match group.class {
                WeightClass::High => breakdown.high_matches += matched.len(),
                WeightClass::Medium => breakdown.medium_matches += matched.len(),
            }
            breakdown.raw_score += weight;
            breakdown.groups.push(GroupSignal {
                category: group.category.clone(),
                class: group.class,
                matched,
                weight,
            });
        }

        breakdown
    }

    /// Highest matched weight wins; ties go to the earlier precedence entry.
    fn pick_category(&self, signals: &SignalBreakdown) -> Category {
        let mut totals: Vec<(&str, f64)> = Vec::new();
        for group in &signals.groups {
            match totals.iter_mut().find(|(c, _)| *c == group.category) {
                Some((_, w)) => *w += group.weight,
                None => totals.push((group.category.as_str(), group.weight)),
            }
        }

        let mut best: Option<(&str, f64)> = None;
        for (category, weight) in totals {
            best = match best {
                None => Some((category, weight)),
                Some((best_cat, best_weight)) => {
                    let better = weight > best_weight
                        || (weight == best_weight
                            && self.tables.precedence_rank(category)
                                < self.tables.precedence_rank(best_cat));
                    if better {
                        Some((category, weight))
                    } else {
                        Some((best_cat, best_weight))
                    }
                }
            };
        }

        best.map(|(c, _)| c.to_string())
            .unwrap_or_else(|| OTHER_CATEGORY.to_string())
    }
}

/// Lowercased tokens: runs of ASCII alphanumerics, `-` and `_`.
fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .map(|t| t.trim_matches(|c| c == '-' || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> ConfidenceEvaluator {
        ConfidenceEvaluator::new(KeywordTables::default(), ScoringConfig::default())
    }

    #[test]
    fn test_helm_deployment_is_infrastructure() {
        let task = Task::with_id(
            "t-a",
            "Deploy Helm chart for microservice, kubernetes helm deployment",
        );
        let assessment = evaluator().assess(&task);

        assert_eq!(assessment.category, "infrastructure");
        assert!(assessment.score >= 0.95);
        assert_eq!(assessment.signals.high_matches, 4);
        assert_eq!(assessment.adjustments.category_bonus, 0.10);
    }

    #[test]
    fn test_medium_signal_only() {
        let task = Task::with_id("t-b", "Investigate intermittent test failures");
        let assessment = evaluator().assess(&task);

        assert_eq!(assessment.category, "development");
        assert_eq!(assessment.signals.medium_matches, 1);
        assert!(assessment.score >= 0.10 && assessment.score <= 0.20);
    }

    #[test]
    fn test_many_high_keywords_follow_formula() {
        let task = Task::with_id(
            "t-c",
            "terraform ansible docker cluster rollout on the kubernetes server",
        )
        .with_priority(TaskPriority::High);
        let assessment = evaluator().assess(&task);

        let n = assessment.signals.high_matches as f64;
        assert!(n >= 4.0);
        let expected = (0.30 * n + assessment.adjustments.category_bonus
            - assessment.adjustments.priority_penalty)
            .min(1.0);
        assert_eq!(assessment.score, expected);
        assert_eq!(assessment.score, 1.0);
    }

    #[test]
    fn test_priority_penalty() {
        let evaluator = evaluator();
        let normal = evaluator.assess(&Task::with_id("n", "patch the firewall"));
        let high = evaluator.assess(
            &Task::with_id("h", "patch the firewall").with_priority(TaskPriority::High),
        );

        assert_eq!(high.adjustments.priority_penalty, 0.10);
        assert!((normal.score - high.score - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_empty_description() {
        let assessment = evaluator().assess(&Task::with_id("e", "   \n "));
        assert_eq!(assessment.score, 0.0);
        assert_eq!(assessment.category, UNKNOWN_CATEGORY);
    }

    #[test]
    fn test_no_match_uses_hint() {
        let task = Task::with_id("h", "Renew the office plant order").with_category_hint("Facilities");
        let assessment = evaluator().assess(&task);
        assert_eq!(assessment.score, 0.0);
        assert_eq!(assessment.category, "facilities");
    }

    #[test]
    fn test_no_match_without_hint_is_other() {
        let assessment = evaluator().assess(&Task::with_id("o", "Order lunch"));
        assert_eq!(assessment.category, OTHER_CATEGORY);
        assert_eq!(assessment.score, 0.0);
    }

    #[test]
    fn test_tie_broken_by_precedence() {
        // one security keyword and one cloud keyword carry equal weight
        let assessment = evaluator().assess(&Task::with_id("p", "aws firewall review"));
        assert_eq!(assessment.category, "security");
    }

    #[test]
    fn test_duplicate_keywords_count_once() {
        let once = evaluator().assess(&Task::with_id("1", "helm"));
        let twice = evaluator().assess(&Task::with_id("2", "helm HELM helm"));
        assert_eq!(once.score, twice.score);
        assert_eq!(twice.signals.high_matches, 1);
    }

    #[test]
    fn test_assessment_is_reproducible() {
        let evaluator = evaluator();
        let task = Task::with_id("r", "Audit s3 bucket encryption and monitoring alerts");
        let first = evaluator.assess(&task);
        let second = evaluator.assess(&task);
        assert_eq!(first, second);
        assert_eq!(first.score.to_bits(), second.score.to_bits());
        assert_eq!(first.table_version, KeywordTables::default().version);
    }

    #[test]
    fn test_custom_tables_change_scoring() {
        let mut tables = KeywordTables::default();
        tables.version = "test".to_string();
        tables.groups.retain(|g| g.category == "development");

        let evaluator = ConfidenceEvaluator::new(tables, ScoringConfig::default());
        let assessment = evaluator.assess(&Task::with_id("x", "kubernetes helm deploy"));
        assert_eq!(assessment.score, 0.0);
        assert_eq!(assessment.table_version, "test");
    }

    #[test]
    fn test_tokenizer_strips_punctuation() {
        let tokens = tokenize("Deploy: helm-chart, (k8s)!");
        assert!(tokens.contains("deploy"));
        assert!(tokens.contains("helm-chart"));
        assert!(tokens.contains("k8s"));
    }
}
