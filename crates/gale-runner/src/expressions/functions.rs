// Built-in expression functions. The status functions (success / failure /
// cancelled / always) are not implemented here: they are injected values
// supplied by the job runtime, resolved in the evaluator itself.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{stringify, EvalError, EvaluationContext};

/// Dispatch a non-status function call. `name` is already lowercased.
pub fn call(name: &str, args: &[Value], ctx: &EvaluationContext) -> Result<Value, EvalError> {
    match name {
        "contains" => contains(args),
        "startswith" => starts_with(args),
        "endswith" => ends_with(args),
        "format" => format_fn(args),
        "join" => join(args),
        "tojson" => to_json(args),
        "fromjson" => from_json(args),
        "hashfiles" => hash_files(args, ctx),
        other => Err(EvalError::new(format!("unknown function '{}'", other))),
    }
}

fn expect_args(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        return Err(EvalError::new(format!(
            "function '{}' expects {}..{} arguments, got {}",
            name,
            min,
            max,
            args.len()
        )));
    }
    Ok(())
}

/// `contains(search, item)`: array membership or case-insensitive substring.
fn contains(args: &[Value]) -> Result<Value, EvalError> {
    expect_args("contains", args, 2, 2)?;
    let found = match &args[0] {
        Value::Array(items) => items.iter().any(|item| loose_equal(item, &args[1])),
        other => {
            let haystack = stringify(other).to_lowercase();
            let needle = stringify(&args[1]).to_lowercase();
            haystack.contains(&needle)
        }
    };
    Ok(Value::Bool(found))
}

fn starts_with(args: &[Value]) -> Result<Value, EvalError> {
    expect_args("startsWith", args, 2, 2)?;
    let text = stringify(&args[0]).to_lowercase();
    let prefix = stringify(&args[1]).to_lowercase();
    Ok(Value::Bool(text.starts_with(&prefix)))
}

fn ends_with(args: &[Value]) -> Result<Value, EvalError> {
    expect_args("endsWith", args, 2, 2)?;
    let text = stringify(&args[0]).to_lowercase();
    let suffix = stringify(&args[1]).to_lowercase();
    Ok(Value::Bool(text.ends_with(&suffix)))
}

/// `format('{0} {1}', a, b)` with `{{` / `}}` escapes.
fn format_fn(args: &[Value]) -> Result<Value, EvalError> {
    if args.is_empty() {
        return Err(EvalError::new("function 'format' expects a format string"));
    }
    let template = stringify(&args[0]);
    let mut result = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    result.push('{');
                    continue;
                }
                let mut digits = String::new();
                for d in chars.by_ref() {
                    if d == '}' {
                        break;
                    }
                    digits.push(d);
                }
                let index: usize = digits.parse().map_err(|_| {
                    EvalError::new(format!("format: invalid placeholder '{{{}}}'", digits))
                })?;
                let value = args.get(index + 1).ok_or_else(|| {
                    EvalError::new(format!("format: no argument for placeholder {{{}}}", index))
                })?;
                result.push_str(&stringify(value));
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    result.push('}');
                } else {
                    return Err(EvalError::new("format: unmatched '}'"));
                }
            }
            other => result.push(other),
        }
    }
    Ok(Value::String(result))
}

/// `join(array, separator?)`; the default separator is `,`.
fn join(args: &[Value]) -> Result<Value, EvalError> {
    expect_args("join", args, 1, 2)?;
    let separator = args.get(1).map(stringify).unwrap_or_else(|| ",".to_string());
    let joined = match &args[0] {
        Value::Array(items) => items
            .iter()
            .map(stringify)
            .collect::<Vec<_>>()
            .join(&separator),
        other => stringify(other),
    };
    Ok(Value::String(joined))
}

fn to_json(args: &[Value]) -> Result<Value, EvalError> {
    expect_args("toJSON", args, 1, 1)?;
    serde_json::to_string_pretty(&args[0])
        .map(Value::String)
        .map_err(|err| EvalError::new(format!("toJSON: {}", err)))
}

fn from_json(args: &[Value]) -> Result<Value, EvalError> {
    expect_args("fromJSON", args, 1, 1)?;
    let text = stringify(&args[0]);
    serde_json::from_str(&text)
        .map_err(|err| EvalError::new(format!("fromJSON: invalid JSON: {}", err)))
}

/// `hashFiles(patterns...)`: SHA-256 over the sorted set of workspace files
/// matching any pattern; the empty string when nothing matches.
fn hash_files(args: &[Value], ctx: &EvaluationContext) -> Result<Value, EvalError> {
    if args.is_empty() {
        return Err(EvalError::new("function 'hashFiles' expects at least one pattern"));
    }
    let workspace = match ctx.workspace() {
        Some(dir) => dir.to_path_buf(),
        None => return Ok(Value::String(String::new())),
    };

    let patterns: Vec<String> = args.iter().map(stringify).collect();
    let mut matched: Vec<std::path::PathBuf> = Vec::new();

    for entry in walkdir::WalkDir::new(&workspace)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(&workspace) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if patterns.iter().any(|p| glob_match(p, &relative)) {
            matched.push(entry.path().to_path_buf());
        }
    }

    if matched.is_empty() {
        return Ok(Value::String(String::new()));
    }
    matched.sort();

    // Hash of per-file hashes, matching the hosted runner's construction.
    let mut outer = Sha256::new();
    for path in &matched {
        let content = std::fs::read(path)
            .map_err(|err| EvalError::new(format!("hashFiles: {}: {}", path.display(), err)))?;
        let file_hash = Sha256::digest(&content);
        outer.update(file_hash);
    }
    Ok(Value::String(format!("{:x}", outer.finalize())))
}

/// Minimal glob matching over `/`-separated paths: `**` crosses separators,
/// `*` matches within a segment, `?` matches one character.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
        match (pattern.first(), path.first()) {
            (None, None) => true,
            (Some(&"**"), _) => {
                // `**` consumes zero or more leading path segments.
                if match_segments(&pattern[1..], path) {
                    return true;
                }
                match path.first() {
                    Some(_) => match_segments(pattern, &path[1..]),
                    None => false,
                }
            }
            (Some(seg), Some(part)) => {
                match_segment(seg, part) && match_segments(&pattern[1..], &path[1..])
            }
            _ => false,
        }
    }

    fn match_segment(pattern: &str, text: &str) -> bool {
        let p: Vec<char> = pattern.chars().collect();
        let t: Vec<char> = text.chars().collect();
        match_chars(&p, &t)
    }

    fn match_chars(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                match_chars(&pattern[1..], text)
                    || (!text.is_empty() && match_chars(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => match_chars(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => match_chars(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    match_segments(&pattern_segments, &path_segments)
}

/// Equality as used by `contains` over arrays: strings case-insensitive,
/// otherwise strict same-type equality.
fn loose_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> EvaluationContext {
        EvaluationContext::new()
    }

    #[test]
    fn test_contains_string() {
        assert_eq!(
            call("contains", &[json!("Hello World"), json!("o w")], &ctx()).unwrap(),
            json!(true)
        );
        assert_eq!(
            call("contains", &[json!("hello"), json!("xyz")], &ctx()).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn test_contains_array() {
        assert_eq!(
            call("contains", &[json!(["a", "b"]), json!("A")], &ctx()).unwrap(),
            json!(true)
        );
        assert_eq!(
            call("contains", &[json!([1, 2]), json!(3)], &ctx()).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn test_starts_ends_with() {
        assert_eq!(
            call("startswith", &[json!("refs/heads/main"), json!("REFS/")], &ctx()).unwrap(),
            json!(true)
        );
        assert_eq!(
            call("endswith", &[json!("file.tar.gz"), json!(".GZ")], &ctx()).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_format() {
        assert_eq!(
            call(
                "format",
                &[json!("{0} + {1} = {2}"), json!(1), json!(2), json!(3)],
                &ctx()
            )
            .unwrap(),
            json!("1 + 2 = 3")
        );
        assert_eq!(
            call("format", &[json!("{{literal}}")], &ctx()).unwrap(),
            json!("{literal}")
        );
        assert!(call("format", &[json!("{1}"), json!("only")], &ctx()).is_err());
    }

    #[test]
    fn test_join() {
        assert_eq!(
            call("join", &[json!(["a", "b", "c"])], &ctx()).unwrap(),
            json!("a,b,c")
        );
        assert_eq!(
            call("join", &[json!(["a", "b"]), json!(" - ")], &ctx()).unwrap(),
            json!("a - b")
        );
        assert_eq!(call("join", &[json!("solo")], &ctx()).unwrap(), json!("solo"));
    }

    #[test]
    fn test_to_from_json() {
        let round = call("fromjson", &[call("tojson", &[json!({"k": 1})], &ctx()).unwrap()], &ctx())
            .unwrap();
        assert_eq!(round, json!({"k": 1}));
        assert_eq!(
            call("fromjson", &[json!("[\"a\",\"b\"]")], &ctx()).unwrap(),
            json!(["a", "b"])
        );
        assert!(call("fromjson", &[json!("not json")], &ctx()).is_err());
    }

    #[test]
    fn test_unknown_function() {
        assert!(call("nope", &[], &ctx()).is_err());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("**/*.rs", "src/main.rs"));
        assert!(glob_match("**/*.rs", "deep/nested/dir/lib.rs"));
        assert!(glob_match("*.lock", "Cargo.lock"));
        assert!(!glob_match("*.lock", "sub/Cargo.lock"));
        assert!(glob_match("src/**", "src/a/b/c.txt"));
        assert!(glob_match("a?c.txt", "abc.txt"));
        assert!(!glob_match("a?c.txt", "ac.txt"));
    }

    #[test]
    fn test_hash_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.lock"), "contents-a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "contents-b").unwrap();

        let mut ctx = EvaluationContext::new();
        ctx.set_workspace(dir.path());

        let hash1 = call("hashfiles", &[json!("*.lock")], &ctx).unwrap();
        assert_ne!(hash1, json!(""));

        // Same content hashes identically; different pattern set differs.
        let hash2 = call("hashfiles", &[json!("*.lock")], &ctx).unwrap();
        assert_eq!(hash1, hash2);
        let hash3 = call("hashfiles", &[json!("*.lock"), json!("*.txt")], &ctx).unwrap();
        assert_ne!(hash1, hash3);

        // No matches -> empty string.
        assert_eq!(call("hashfiles", &[json!("*.zip")], &ctx).unwrap(), json!(""));
    }
}
