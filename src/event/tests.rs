use super::*;

fn name(s: &str) -> EventName {
    EventName::from(s)
}

#[test]
fn test_parse_splits_on_dots() {
    let n = name("log.pub");
    assert_eq!(n.segments(), &["log".to_string(), "pub".to_string()]);
    assert_eq!(n.to_string(), "log.pub");
}

#[test]
fn test_array_form_equals_string_form() {
    assert_eq!(EventName::from(["log", "pub"]), name("log.pub"));
}

#[test]
fn test_empty_segments_are_invalid() {
    assert!(name("log.pub").is_valid());
    assert!(!name("log..pub").is_valid());
    assert!(!name("").is_valid());
    assert!(!EventName::from_segments(Vec::<String>::new()).is_valid());
}

#[test]
fn test_registry_key_prefixes_mode() {
    assert_eq!(EventId::one("log.pub").registry_key(), name("one.log.pub"));
    assert_eq!(EventId::all("log.send").registry_key(), name("all.log.send"));
    assert_eq!(EventId::all("log.send").to_string(), "all.log.send");
}

#[test]
fn test_exact_match() {
    assert!(name("a.b").matches(&name("a.b")));
    assert!(!name("a.b").matches(&name("a.c")));
    assert!(!name("a.b").matches(&name("a.b.c")));
}

#[test]
fn test_single_wildcard_matches_one_segment() {
    assert!(name("a.*").matches(&name("a.b")));
    assert!(!name("a.*").matches(&name("a")));
    assert!(!name("a.*").matches(&name("a.b.c")));
    assert!(name("*.b").matches(&name("x.b")));
}

#[test]
fn test_multi_wildcard_matches_any_depth() {
    assert!(name("a.**").matches(&name("a")));
    assert!(name("a.**").matches(&name("a.b")));
    assert!(name("a.**").matches(&name("a.b.c.d")));
    assert!(name("**.d").matches(&name("a.b.c.d")));
    assert!(name("a.**.d").matches(&name("a.d")));
    assert!(name("a.**.**.d").matches(&name("a.x.d")));
    assert!(!name("a.**.d").matches(&name("a.b.c")));
    assert!(name("**").matches(&name("anything.at.all")));
}

#[test]
fn test_topic_pattern_translates_multi_wildcard() {
    assert_eq!(name("log.**").topic_pattern(), "log.#");
    assert_eq!(name("log.*.x").topic_pattern(), "log.*.x");
    assert_eq!(name("log.pub").topic_pattern(), "log.pub");
}

#[test]
fn test_topic_matching_with_hash() {
    let pattern = ["log", "#"];
    assert!(match_segments(&pattern, &["log"], TOPIC_WILDCARD_MANY));
    assert!(match_segments(&pattern, &["log", "a", "b"], TOPIC_WILDCARD_MANY));
    assert!(!match_segments(&pattern, &["other", "a"], TOPIC_WILDCARD_MANY));
}

#[test]
fn test_has_wildcards() {
    assert!(name("a.*").has_wildcards());
    assert!(name("a.**").has_wildcards());
    assert!(!name("a.b").has_wildcards());
}

#[test]
fn test_registry_key_round_trips_through_event_id() {
    let id = EventId::all("log.**");
    let key = id.registry_key();
    assert_eq!(key.to_string(), "all.log.**");
    assert_eq!(EventId::from_registry_key(&key), Some(id));
    assert_eq!(EventId::from_registry_key(&name("bogus.x")), None);
}
