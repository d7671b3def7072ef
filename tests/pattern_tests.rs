// Integration tests for the interrupt pattern matcher.

use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use voicegate::patterns::PatternMatcher;

const BASE_CONFIG: &str = r#"
interrupts:
  dnc:
    name: Do Not Call
    description: Caller wants off the list
    audio_file: dnc.wav
    priority: 1
    patterns:
      - type: exact
        phrases:
          - stop calling
          - remove me from your list
  robot:
    name: Robot Detection
    description: Caller suspects automation
    audio_file: robot.wav
    priority: 2
    patterns:
      - type: required
        required_words:
          - [robot, automated, computer]
          - [you, this]
  not_interested:
    name: Not Interested
    description: Caller declines
    audio_file: bye.wav
    priority: 3
    patterns:
      - type: combo
        words:
          - [not, interested]
          - [waste, time]
  callback:
    name: Callback Request
    description: Caller asks for a later call
    audio_file: callback.wav
    priority: 4
    patterns:
      - type: alternative
        word_groups:
          - [call, ring]
          - [back, later, tomorrow]

settings:
  case_sensitive: false
  partial_word_match: true
  max_words_between: 3
  reload_on_detection: false
"#;

fn write_config(contents: &str) -> Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("interrupts.yaml");
    fs::write(&path, contents)?;
    Ok((dir, path))
}

#[test]
fn exact_phrases_match_case_insensitively() -> Result<()> {
    let (_dir, path) = write_config(BASE_CONFIG)?;
    let matcher = PatternMatcher::load(&path)?;

    for text in ["stop calling", "Stop calling", "STOP CALLING", "please stop calling me"] {
        let rule = matcher.detect(text).expect(text);
        assert_eq!(rule.id, "dnc");
        assert_eq!(rule.name, "Do Not Call");
    }
    assert!(matcher.detect("hello world").is_none());
    Ok(())
}

#[test]
fn combo_requires_all_words_of_one_list() -> Result<()> {
    let (_dir, path) = write_config(BASE_CONFIG)?;
    let matcher = PatternMatcher::load(&path)?;

    assert_eq!(
        matcher.detect("I'm really not that interested").unwrap().id,
        "not_interested"
    );
    assert_eq!(
        matcher.detect("what a waste of my time").unwrap().id,
        "not_interested"
    );
    // One word from each list is not enough.
    assert!(matcher.detect("I am interested in less waste").is_none());
    Ok(())
}

#[test]
fn required_needs_a_hit_in_every_group() -> Result<()> {
    let (_dir, path) = write_config(BASE_CONFIG)?;
    let matcher = PatternMatcher::load(&path)?;

    assert_eq!(matcher.detect("are you a robot").unwrap().id, "robot");
    assert_eq!(matcher.detect("is this automated").unwrap().id, "robot");
    // Group two ("you"/"this") has no hit.
    assert!(matcher.detect("robots are everywhere").is_none());
    Ok(())
}

#[test]
fn alternative_evaluates_like_required() -> Result<()> {
    let (_dir, path) = write_config(BASE_CONFIG)?;
    let matcher = PatternMatcher::load(&path)?;

    assert_eq!(matcher.detect("call me back").unwrap().id, "callback");
    assert_eq!(matcher.detect("ring me tomorrow").unwrap().id, "callback");
    // Only the first group matches.
    assert!(matcher.detect("give me a call sometime").is_none());
    Ok(())
}

#[test]
fn lowest_priority_rule_wins_when_several_match() -> Result<()> {
    let (_dir, path) = write_config(BASE_CONFIG)?;
    let matcher = PatternMatcher::load(&path)?;

    // Matches dnc (priority 1) and not_interested (priority 3).
    let rule = matcher
        .detect("stop calling, I'm not interested")
        .expect("should match");
    assert_eq!(rule.id, "dnc");
    assert_eq!(rule.priority, 1);
    Ok(())
}

#[test]
fn rules_are_sorted_by_priority_at_load() -> Result<()> {
    let (_dir, path) = write_config(BASE_CONFIG)?;
    let matcher = PatternMatcher::load(&path)?;

    let priorities: Vec<i32> = matcher.rules().iter().map(|r| r.priority).collect();
    assert_eq!(priorities, vec![1, 2, 3, 4]);
    Ok(())
}

#[test]
fn hot_reload_picks_up_a_modified_file() -> Result<()> {
    let reloading = BASE_CONFIG.replace("reload_on_detection: false", "reload_on_detection: true");
    let (_dir, path) = write_config(&reloading)?;
    let matcher = PatternMatcher::load(&path)?;

    assert!(matcher.detect("take me off the registry").is_none());

    // Rewrite the config with a new phrase; mtime moves forward past the
    // load time, so the next detection reloads.
    let updated = reloading.replace("- stop calling", "- stop calling\n          - off the registry");
    fs::write(&path, &updated)?;

    assert_eq!(
        matcher.detect("take me off the registry").unwrap().id,
        "dnc"
    );
    Ok(())
}

#[test]
fn failed_reload_keeps_the_current_rules() -> Result<()> {
    let reloading = BASE_CONFIG.replace("reload_on_detection: false", "reload_on_detection: true");
    let (_dir, path) = write_config(&reloading)?;
    let matcher = PatternMatcher::load(&path)?;

    fs::write(&path, "interrupts: [this is not valid")?;

    // Detection still works off the previously loaded rules.
    assert_eq!(matcher.detect("stop calling").unwrap().id, "dnc");
    Ok(())
}

#[test]
fn invalid_config_fails_to_load() -> Result<()> {
    let (_dir, path) = write_config("interrupts: [broken")?;
    assert!(PatternMatcher::load(&path).is_err());
    Ok(())
}
