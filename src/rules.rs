//! Suffix-rule matching for per-upstream routing and the blacklist.
//!
//! A pattern is a label sequence matched against the domain from the right:
//! `"."` matches every non-empty domain, `"a.com"` matches only `a.com`, and
//! `".a.com"` matches strict sub-labels of `a.com` but not `a.com` itself.

/// A parsed rule: the pattern split on `.` with empty labels preserved.
pub type Rule = Vec<String>;

/// Parse raw pattern strings into rules.
///
/// Empty patterns are skipped; a missing trailing dot is appended so every
/// rule ends in the root label.
pub fn parse_rules(raw: &[String]) -> Vec<Rule> {
    let mut rules = Vec::new();
    for r in raw {
        if r.is_empty() {
            continue;
        }
        let mut r = r.clone();
        if !r.ends_with('.') {
            r.push('.');
        }
        rules.push(r.split('.').map(str::to_string).collect());
    }
    rules
}

/// Whether any rule in the set matches the domain.
///
/// Labels are aligned right-to-left; an empty rule label matches any domain
/// label. The rule must be fully consumed, and leftover domain labels are
/// only allowed when the rule's leading label is empty (strict-suffix form).
pub fn has_matched_rule(rules: &[Rule], domain: &str) -> bool {
    'outer: for rule in rules {
        let labels: Vec<&str> = domain.split('.').collect();
        let mut i = rule.len() as isize - 1;
        let mut j = labels.len() as isize - 1;
        while i >= 0 && j >= 0 {
            if rule[i as usize] != labels[j as usize] && !rule[i as usize].is_empty() {
                continue 'outer;
            }
            i -= 1;
            j -= 1;
        }
        if j != -1 && i == -1 && !rule[0].is_empty() {
            continue 'outer;
        }
        if i == -1 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(rules: &[Rule], cases: &[(&str, bool)]) {
        for (domain, want) in cases {
            assert_eq!(
                has_matched_rule(rules, domain),
                *want,
                "rules {rules:?} domain {domain:?}"
            );
        }
    }

    #[test]
    fn dot_matches_everything() {
        let rules = parse_rules(&[".".to_string()]);
        check(
            &rules,
            &[
                ("", false),
                ("a.com.", true),
                ("b.a.com.", true),
                (".b.a.com.cn.", true),
                ("b.a.com.cn.", true),
                ("d.b.a.com.", true),
            ],
        );
    }

    #[test]
    fn empty_pattern_never_matches() {
        let rules = parse_rules(&["".to_string()]);
        assert!(rules.is_empty());
        check(&rules, &[("", false), ("a.com.", false), ("b.a.com.", false)]);
    }

    #[test]
    fn exact_pattern() {
        let rules = parse_rules(&["a.com.".to_string()]);
        check(
            &rules,
            &[
                ("", false),
                ("a.com.", true),
                ("b.a.com.", false),
                (".b.a.com.cn.", false),
                ("b.a.com.cn.", false),
                ("d.b.a.com.", false),
            ],
        );
    }

    #[test]
    fn strict_suffix_pattern() {
        let rules = parse_rules(&[".a.com.".to_string()]);
        check(
            &rules,
            &[
                ("", false),
                ("a.com.", false),
                ("b.a.com.", true),
                (".b.a.com.cn.", false),
                ("b.a.com.cn.", false),
                ("d.b.a.com.", true),
            ],
        );
    }

    #[test]
    fn multi_label_exact_pattern() {
        let rules = parse_rules(&["b.d.com.".to_string()]);
        check(
            &rules,
            &[
                ("", false),
                ("a.com.", false),
                (".a.com.", false),
                ("b.d.com.", true),
                (".b.d.com.cn.", false),
                ("b.d.com.cn.", false),
                (".c.d.com.", false),
                ("b.d.a.com.", false),
            ],
        );
    }

    #[test]
    fn trailing_dot_is_appended() {
        let rules = parse_rules(&["a.com".to_string()]);
        check(&rules, &[("a.com.", true), ("b.a.com.", false)]);
    }
}
