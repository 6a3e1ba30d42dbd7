use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

pub type EnvMap = BTreeMap<String, String>;

/// Read a flat KEY=value document without touching the process environment.
pub fn read_env_file(path: &Path) -> Result<EnvMap> {
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut vars = EnvMap::new();
    for item in iter {
        let (k, v) = item.with_context(|| format!("parsing {}", path.display()))?;
        vars.insert(k, v);
    }
    Ok(vars)
}

/// Base `.env` (optional) overlaid by `.env.<profile>` (required).
/// Returns the merged map plus the names of the files that were read.
pub fn load_layers(cwd: &Path, profile: &str) -> Result<(EnvMap, Vec<String>)> {
    let mut loaded: Vec<String> = Vec::new();
    let mut merged = EnvMap::new();

    let base = cwd.join(".env");
    if base.exists() {
        merged.extend(read_env_file(&base)?);
        loaded.push(".env".to_string());
    }

    let overlay = cwd.join(overlay_file_name(profile));
    merged.extend(read_env_file(&overlay)?);
    loaded.push(overlay_file_name(profile));

    Ok((merged, loaded))
}

pub fn overlay_file_name(profile: &str) -> String {
    format!(".env.{}", profile.trim())
}

/// Let the process environment override any key the documents (or the caller) know about.
pub fn apply_overrides<F>(vars: &mut EnvMap, known: &[&str], lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut keys: Vec<String> = vars.keys().cloned().collect();
    keys.extend(known.iter().map(|k| k.to_string()));
    for key in keys {
        if let Some(v) = lookup(&key) {
            vars.insert(key, v);
        }
    }
}

/// Multi-pass expansion of ${VAR} and ${VAR:-default} against the map itself.
/// dotenvy already substitutes plain references inside double-quoted and bare values,
/// so this mostly matters for single-quoted values and references across layers.
pub fn expand_all(vars: &mut EnvMap) {
    for _pass in 0..5 {
        let mut changes = 0;
        let keys: Vec<String> = vars.keys().cloned().collect();

        for key in keys {
            let Some(val) = vars.get(&key) else { continue };
            if !val.contains("${") {
                continue;
            }
            let new_val = expand_value(&key, val, vars);
            if new_val != *val {
                vars.insert(key, new_val);
                changes += 1;
            }
        }
        if changes == 0 {
            break;
        }
    }
}

fn expand_value(current_key: &str, input: &str, vars: &EnvMap) -> String {
    let mut out = String::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && i + 1 < chars.len() && chars[i + 1] == '{' {
            let mut j = i + 2;
            while j < chars.len() && chars[j] != '}' {
                j += 1;
            }
            if j >= chars.len() {
                out.push(chars[i]);
                i += 1;
                continue;
            }
            let inner: String = chars[i + 2..j].iter().collect();
            let (name, def) = match inner.find(":-") {
                Some(pos) => (inner[..pos].to_string(), Some(inner[pos + 2..].to_string())),
                None => (inner, None),
            };

            let resolved = if name != current_key {
                vars.get(&name).filter(|v| !v.is_empty())
            } else {
                None
            };

            if let Some(v) = resolved {
                out.push_str(v);
            } else if let Some(d) = def {
                out.push_str(&d);
            }

            i = j + 1;
            continue;
        }

        out.push(chars[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn map(pairs: &[(&str, &str)]) -> EnvMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn overlay_overrides_base() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".env"), "DB_PORT=5432\nDB_NAME=app\n").unwrap();
        fs::write(dir.path().join(".env.minimal"), "DB_PORT=6543\n").unwrap();

        let (vars, loaded) = load_layers(dir.path(), "minimal").unwrap();
        assert_eq!(vars["DB_PORT"], "6543");
        assert_eq!(vars["DB_NAME"], "app");
        assert_eq!(loaded, vec![".env", ".env.minimal"]);
    }

    #[test]
    fn missing_overlay_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".env"), "DB_PORT=5432\n").unwrap();
        assert!(load_layers(dir.path(), "full").is_err());
    }

    #[test]
    fn expands_references_and_defaults() {
        let mut vars = map(&[
            ("DB_HOST", "localhost"),
            ("DB_URL", "postgres://${DB_HOST}:${DB_PORT:-5432}/app"),
            ("SELF", "${SELF:-x}"),
        ]);
        expand_all(&mut vars);
        assert_eq!(vars["DB_URL"], "postgres://localhost:5432/app");
        assert_eq!(vars["SELF"], "x");
    }

    #[test]
    fn overrides_only_touch_known_keys() {
        let mut vars = map(&[("API_PORT", "8080")]);
        apply_overrides(&mut vars, &["UI_PORT"], |k| match k {
            "API_PORT" => Some("9000".into()),
            "UI_PORT" => Some("3001".into()),
            "PATH" => Some("/bin".into()),
            _ => None,
        });
        assert_eq!(vars["API_PORT"], "9000");
        assert_eq!(vars["UI_PORT"], "3001");
        assert!(!vars.contains_key("PATH"));
    }
}
