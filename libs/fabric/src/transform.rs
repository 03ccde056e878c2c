//! Address transform rules
//!
//! Patterns are matched against the whole input. `*` matches any run of
//! characters and `%` any run without `/`; every wildcard is a capture,
//! numbered from `$1`. The first matching rule wins.

use crate::error::{Error, Result};

pub trait Transform {
    /// Append a rule
    fn rule(&mut self, pattern: &str, substitution: &str);

    /// Rewrite `input` with the first matching rule, `None` if none matched
    fn apply(&self, input: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    pattern: Vec<char>,
    substitution: String,
}

/// Ordered glob rules
#[derive(Debug, Clone, Default)]
pub struct Rules {
    rules: Vec<Rule>,
}

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Transform for Rules {
    fn rule(&mut self, pattern: &str, substitution: &str) {
        self.rules.push(Rule {
            pattern: pattern.chars().collect(),
            substitution: substitution.to_string(),
        });
    }

    fn apply(&self, input: &str) -> Result<Option<String>> {
        let input: Vec<char> = input.chars().collect();
        for rule in &self.rules {
            let mut captures = Vec::new();
            if matches(&rule.pattern, &input, &mut captures) {
                return substitute(&rule.substitution, &captures).map(Some);
            }
        }
        Ok(None)
    }
}

fn matches(pattern: &[char], input: &[char], captures: &mut Vec<String>) -> bool {
    let Some((&first, rest)) = pattern.split_first() else {
        return input.is_empty();
    };
    match first {
        '*' | '%' => {
            for len in 0..=input.len() {
                let run = &input[..len];
                if first == '%' && run.contains(&'/') {
                    break;
                }
                captures.push(run.iter().collect());
                if matches(rest, &input[len..], captures) {
                    return true;
                }
                captures.pop();
            }
            false
        }
        c => match input.split_first() {
            Some((&head, tail)) if head == c => matches(rest, tail, captures),
            _ => false,
        },
    }
}

fn substitute(template: &str, captures: &[String]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().and_then(|d| d.to_digit(10)) {
            Some(0) | None => out.push('$'),
            Some(n) => {
                chars.next();
                let capture = captures.get(n as usize - 1).ok_or_else(|| {
                    Error::Custom(format!(
                        "rule references ${} but the pattern has {} wildcards",
                        n,
                        captures.len()
                    ))
                })?;
                out.push_str(capture);
            }
        }
    }
    Ok(out)
}
