//! 逻辑路径工具
//!
//! 所有索引中的路径都使用 `/` 分隔的绝对路径，目录以 `/` 结尾。

use std::cmp::Ordering;

/// 注册到 SQLite 的路径排序规则名称
pub const PATH_COLLATION: &str = "pathorder";

/// 规范化路径分隔符并合并重复的 `/`，保证以 `/` 开头
pub fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');

    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }

    out
}

/// 连接两个路径并规范化结果
pub fn join_properly(base: &str, path: &str) -> String {
    normalize(&format!("{}/{}", base, path))
}

/// 简单连接两个路径（不处理 `..`）
pub fn join(base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return base.to_string();
    }

    format!("{}/{}", base.trim_end_matches('/'), path)
}

pub fn dir_normalize(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

pub fn dir_denormalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 拆分为 (父目录, 文件名)
pub fn split(path: &str) -> (String, String) {
    let path = dir_denormalize(path);

    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => (String::new(), path),
    }
}

/// 去掉前缀，返回以 `/` 开头的相对路径；不在前缀下时返回 None
pub fn cut_prefix(path: &str, prefix: &str) -> Option<String> {
    let prefix = dir_normalize(prefix);

    if dir_normalize(path) == prefix {
        return Some("/".to_string());
    }

    path.strip_prefix(&prefix).map(|rest| format!("/{}", rest))
}

/// `path` 是否位于 `parent` 子树内（包括 `parent` 本身）
pub fn contains(parent: &str, path: &str) -> bool {
    let parent = dir_normalize(parent);
    dir_normalize(path).starts_with(&parent)
}

/// 转义 GLOB 元字符
pub fn escape_glob(path: &str) -> String {
    let mut out = String::with_capacity(path.len());

    for c in path.chars() {
        match c {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }

    out
}

/// 路径排序：`/` 排在所有其他字符之前
///
/// 在这个顺序下，一个目录（`/d/`）之后紧跟着它的全部子项，
/// 文件 `/p` 与目录 `/p/` 相邻。
pub fn compare(a: &str, b: &str) -> Ordering {
    fn key(c: u8) -> (bool, u8) {
        (c != b'/', c)
    }

    a.bytes().map(key).cmp(b.bytes().map(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a//b\\c"), "/a/b/c");
        assert_eq!(normalize(""), "/");
        assert_eq!(join_properly("/", "dir/"), "/dir/");
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split("/a/b"), ("/a".to_string(), "b".to_string()));
        assert_eq!(split("/a/"), ("/".to_string(), "a".to_string()));
        assert_eq!(join("/a/", "/b"), "/a/b");
        assert_eq!(join("/a", ""), "/a");
    }

    #[test]
    fn test_cut_prefix() {
        assert_eq!(cut_prefix("/root/a/b", "/root"), Some("/a/b".to_string()));
        assert_eq!(cut_prefix("/root/", "/root"), Some("/".to_string()));
        assert_eq!(cut_prefix("/rootless", "/root"), None);
    }

    #[test]
    fn test_contains() {
        assert!(contains("/dir", "/dir/x"));
        assert!(contains("/dir/", "/dir"));
        assert!(!contains("/dir", "/dir-x"));
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("/a*b?[c]"), "/a[*]b[?][[]c]");
    }

    #[test]
    fn test_compare_orders_children_after_dir() {
        let mut paths = vec!["/p-x", "/p/", "/p/a", "/p", "/o"];
        paths.sort_by(|a, b| compare(a, b));
        assert_eq!(paths, vec!["/o", "/p", "/p/", "/p/a", "/p-x"]);
    }
}
