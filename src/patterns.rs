use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;
use tracing::{info, warn};

/// On-disk shape of the interrupts file: rules keyed by id plus settings.
#[derive(Debug, Clone, Deserialize)]
struct InterruptFile {
    interrupts: HashMap<String, RuleSpec>,
    #[serde(default)]
    settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    audio_file: String,
    #[serde(default)]
    priority: i32,
    patterns: Vec<Pattern>,
}

/// A single match pattern inside a rule, tagged by `type` in the YAML.
///
/// `Required` and `Alternative` evaluate identically (every group needs at
/// least one token-substring hit); the two spellings exist so config authors
/// can state intent. Keep them behaviorally equal.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Pattern {
    /// Matches when any phrase appears as a substring of the text.
    Exact { phrases: Vec<String> },
    /// Matches when some inner list has all of its words as substrings.
    Combo { words: Vec<Vec<String>> },
    /// Matches when every group has a word matching some token of the text.
    Required { required_words: Vec<Vec<String>> },
    /// Matches when every group has a word matching some token of the text.
    Alternative { word_groups: Vec<Vec<String>> },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub case_sensitive: bool,
    pub partial_word_match: bool,
    pub max_words_between: u32,
    pub reload_on_detection: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            partial_word_match: true,
            max_words_between: 3,
            reload_on_detection: false,
        }
    }
}

/// A loaded interrupt rule. `id` is the rule's key in the YAML map and is
/// what the flow engine uses to locate the matching interrupt node.
#[derive(Debug, Clone)]
pub struct InterruptRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub audio_file: String,
    pub priority: i32,
    pub patterns: Vec<Pattern>,
}

struct MatcherState {
    /// Rules sorted ascending by priority at load time, ties broken by id so
    /// detection order is stable across reloads.
    rules: Vec<InterruptRule>,
    settings: Settings,
    loaded_at: SystemTime,
}

/// Priority-ordered interrupt detector over transcript text.
///
/// Detection takes the read lock; hot-reload swaps the rule set under the
/// write lock. A reload that fails to parse keeps the current rules.
pub struct PatternMatcher {
    config_path: PathBuf,
    state: RwLock<MatcherState>,
}

impl PatternMatcher {
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let state = load_state(&config_path)?;
        info!(
            "Loaded interrupt config with {} rules from {}",
            state.rules.len(),
            config_path.display()
        );
        Ok(Self {
            config_path,
            state: RwLock::new(state),
        })
    }

    /// Returns the matching rule of lowest priority, if any.
    pub fn detect(&self, text: &str) -> Option<InterruptRule> {
        self.reload_if_stale();

        let state = self.state.read().expect("pattern matcher lock poisoned");
        let search = if state.settings.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        };

        for rule in &state.rules {
            if rule_matches(&search, rule, &state.settings) {
                info!("Pattern match found: {} - '{}'", rule.name, text);
                return Some(rule.clone());
            }
        }
        None
    }

    /// All loaded rules in detection order.
    pub fn rules(&self) -> Vec<InterruptRule> {
        self.state
            .read()
            .expect("pattern matcher lock poisoned")
            .rules
            .clone()
    }

    fn reload_if_stale(&self) {
        let (reload_enabled, loaded_at) = {
            let state = self.state.read().expect("pattern matcher lock poisoned");
            (state.settings.reload_on_detection, state.loaded_at)
        };
        if !reload_enabled {
            return;
        }

        let modified = match std::fs::metadata(&self.config_path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                warn!("Failed to stat interrupt config: {}", err);
                return;
            }
        };
        if modified <= loaded_at {
            return;
        }

        info!("Interrupt config modified, reloading");
        match load_state(&self.config_path) {
            Ok(fresh) => {
                let mut state = self.state.write().expect("pattern matcher lock poisoned");
                *state = fresh;
            }
            Err(err) => {
                warn!("Failed to reload interrupt config, keeping current rules: {:#}", err);
            }
        }
    }
}

fn load_state(path: &Path) -> Result<MatcherState> {
    let file: InterruptFile = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .with_context(|| format!("failed to read interrupt config {}", path.display()))?
        .try_deserialize()
        .context("failed to parse interrupt config")?;

    let mut rules: Vec<InterruptRule> = file
        .interrupts
        .into_iter()
        .map(|(id, spec)| InterruptRule {
            id,
            name: spec.name,
            description: spec.description,
            audio_file: spec.audio_file,
            priority: spec.priority,
            patterns: spec.patterns,
        })
        .collect();
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

    Ok(MatcherState {
        rules,
        settings: file.settings,
        loaded_at: SystemTime::now(),
    })
}

fn rule_matches(search: &str, rule: &InterruptRule, settings: &Settings) -> bool {
    rule.patterns
        .iter()
        .any(|pattern| pattern_matches(search, pattern, settings))
}

fn pattern_matches(search: &str, pattern: &Pattern, settings: &Settings) -> bool {
    match pattern {
        Pattern::Exact { phrases } => phrases
            .iter()
            .any(|phrase| search.contains(&fold(phrase, settings))),
        Pattern::Combo { words } => words.iter().any(|list| {
            list.iter()
                .all(|word| search.contains(&fold(word, settings)))
        }),
        Pattern::Required { required_words } => all_groups_match(search, required_words, settings),
        Pattern::Alternative { word_groups } => all_groups_match(search, word_groups, settings),
    }
}

/// True when every group contributes at least one word that appears as a
/// substring of some whitespace-separated token of the text.
fn all_groups_match(search: &str, groups: &[Vec<String>], settings: &Settings) -> bool {
    let tokens: Vec<String> = search
        .split_whitespace()
        .map(|token| token.to_lowercase())
        .collect();

    groups.iter().all(|group| {
        group.iter().any(|word| {
            let needle = fold(word, settings);
            tokens.iter().any(|token| token.contains(&needle))
        })
    })
}

fn fold(word: &str, settings: &Settings) -> String {
    if settings.case_sensitive {
        word.to_string()
    } else {
        word.to_lowercase()
    }
}
