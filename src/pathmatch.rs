//! 路径过滤规则
//!
//! 每条规则形如 `+/docs/*` 或 `-*.tmp`：`+` 允许，`-` 排除，省略时视为允许。
//! `*` 匹配任意字符（包括 `/`），`?` 匹配单个字符。
//! 最后一条匹配的规则决定结果；没有规则时全部允许，有规则但都不匹配时拒绝。
//! 目录路径以 `/` 结尾参与匹配。

use crate::error::{Error, Result};
use regex::Regex;

#[derive(Debug, Clone)]
struct Rule {
    allow: bool,
    regex: Regex,
}

#[derive(Debug, Clone, Default)]
pub struct PathMatch {
    rules: Vec<Rule>,
}

impl PathMatch {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let rules = patterns
            .iter()
            .map(|pattern| Self::rule(pattern.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    fn rule(pattern: &str) -> Result<Rule> {
        let (allow, glob) = match pattern.as_bytes().first() {
            Some(b'+') => (true, &pattern[1..]),
            Some(b'-') => (false, &pattern[1..]),
            _ => (true, pattern),
        };

        let mut expr = String::from("^");
        for ch in glob.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| Error::InvalidPattern(pattern.to_string(), e.to_string()))?;
        Ok(Rule { allow, regex })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.rules.is_empty() {
            return true;
        }

        self.rules
            .iter()
            .rev()
            .find(|rule| rule.regex.is_match(path))
            .is_some_and(|rule| rule.allow)
    }
}
