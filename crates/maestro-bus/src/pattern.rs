//! AMQP-style topic pattern matching.

/// Whether `routing_key` matches `pattern`.
///
/// Both are dot-separated. In the pattern, `*` matches exactly one segment
/// and `#` matches zero or more segments; every other segment matches
/// literally.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            // '#' absorbs zero segments, or one and stays greedy.
            match_segments(&pattern[1..], key)
                || (!key.is_empty() && match_segments(pattern, &key[1..]))
        }
        Some(&"*") => !key.is_empty() && match_segments(&pattern[1..], &key[1..]),
        Some(literal) => {
            key.first() == Some(literal) && match_segments(&pattern[1..], &key[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match() {
        assert!(topic_matches(
            "autonomous.task.submitted",
            "autonomous.task.submitted"
        ));
        assert!(!topic_matches(
            "autonomous.task.submitted",
            "autonomous.task.completed"
        ));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        assert!(topic_matches("*.task.completed", "autonomous.task.completed"));
        assert!(topic_matches("continuous.task.*", "continuous.task.c1"));
        assert!(!topic_matches("continuous.task.*", "continuous.task"));
        assert!(!topic_matches("continuous.task.*", "continuous.task.c1.extra"));
    }

    #[test]
    fn hash_matches_zero_or_more() {
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("scheduled.task.#", "scheduled.task"));
        assert!(topic_matches("scheduled.task.#", "scheduled.task.reporter"));
        assert!(topic_matches("scheduled.task.#", "scheduled.task.reporter.timeout"));
        assert!(!topic_matches("scheduled.task.#", "autonomous.task.reporter"));
    }

    #[test]
    fn hash_in_the_middle() {
        assert!(topic_matches("a.#.z", "a.z"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
        assert!(!topic_matches("a.#.z", "a.b.c"));
    }

    #[test]
    fn mixed_wildcards() {
        assert!(topic_matches("*.task.#", "collaborative.task.submitted"));
        assert!(topic_matches("*.task.#", "scheduled.task.r.timeout"));
        assert!(!topic_matches("*.task.#", "task.submitted"));
    }

    #[test]
    fn empty_segments() {
        assert!(topic_matches("", ""));
        assert!(!topic_matches("", "a"));
        assert!(!topic_matches("a", ""));
    }
}
