//! Container environment resolution.
//!
//! The final environment is built from the image environment followed by a
//! merged map of runtime sources (defaults, prefixed host variables, env-file
//! values, explicit `--env` values), later sources winning. `PATH`,
//! `APPEND_PATH`, `PREPEND_PATH` and `LD_LIBRARY_PATH` never pass through
//! verbatim: they are combined into a single `PATH` and a `LD_LIBRARY_PATH`
//! that always carries [`CONTAINER_LIBS`].

use std::collections::HashMap;

/// Host variables carrying this prefix are forwarded with the prefix removed.
pub const ENV_PREFIX: &str = "VESSELENV_";

/// Library directory bound into every container and appended to `LD_LIBRARY_PATH`.
pub const CONTAINER_LIBS: &str = "/.vessel.d/libs";

/// Variables an env-file may never set.
pub const ENV_FILE_BLOCKLIST: [&str; 6] = ["GID", "HOME", "IFS", "OPTIND", "PWD", "UID"];

/// Ordered environment map. Setting an existing key replaces its value in
/// place; new keys are appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentMap {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl EnvironmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(&pos) = self.index.get(&key) {
            self.entries[pos].1 = value;
        } else {
            self.index.insert(key.clone(), self.entries.len());
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index
            .get(key)
            .map(|&pos| self.entries[pos].1.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.index.remove(key)?;
        let (_, value) = self.entries.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(value)
    }

    /// Overlay `other` onto `self`; keys in `other` win.
    pub fn merge(&mut self, other: &EnvironmentMap) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `KEY=VALUE` strings in insertion order.
    pub fn to_env_list(&self) -> Vec<String> {
        self.entries.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Build a map from `KEY=VALUE` strings; entries without `=` or with an
    /// empty key are skipped.
    pub fn from_env_list<S: AsRef<str>>(list: &[S]) -> Self {
        let mut map = Self::new();
        for entry in list {
            if let Some((k, v)) = split_entry(entry.as_ref()) {
                map.set(k, v);
            }
        }
        map
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvironmentMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}

fn split_entry(entry: &str) -> Option<(&str, &str)> {
    match entry.split_once('=') {
        Some((k, v)) if !k.is_empty() => Some((k, v)),
        _ => None,
    }
}

/// Variables every launch receives before user-supplied values.
pub fn default_env(image: &str, bundle: &str) -> EnvironmentMap {
    let mut env = EnvironmentMap::new();
    env.set("VESSEL_CONTAINER", bundle);
    env.set("VESSEL_NAME", image);
    env
}

/// Host variables carrying [`ENV_PREFIX`], with the prefix stripped.
pub fn prefixed_overrides<I>(vars: I) -> EnvironmentMap
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(k, v)| {
            let stripped = k.strip_prefix(ENV_PREFIX)?;
            if stripped.is_empty() {
                None
            } else {
                Some((stripped.to_owned(), v))
            }
        })
        .collect()
}

/// Keep only the env-file assignments that may reach the container.
pub fn env_file_map<S: AsRef<str>>(lines: &[S]) -> EnvironmentMap {
    let mut env = EnvironmentMap::new();
    for line in lines {
        let Some((k, v)) = split_entry(line.as_ref()) else {
            continue;
        };
        if ENV_FILE_BLOCKLIST.contains(&k) {
            tracing::debug!("ignoring {k} set by environment file");
            continue;
        }
        env.set(k, v);
    }
    env
}

/// Produce the final process environment from the image's `KEY=VALUE` list
/// and the merged runtime sources.
pub fn resolve_process_env(image_env: &[String], runtime_env: &EnvironmentMap) -> Vec<String> {
    let mut env = EnvironmentMap::new();
    let mut path = String::new();
    let mut append = String::new();
    let mut prepend = String::new();
    let mut ld_library_path = String::new();

    for entry in image_env {
        let Some((k, v)) = split_entry(entry) else {
            continue;
        };
        match k {
            "PATH" => {
                // Reserve the slot so the combined value keeps the image position.
                env.set("PATH", v);
                v.clone_into(&mut path);
            }
            "APPEND_PATH" => v.clone_into(&mut append),
            "PREPEND_PATH" => v.clone_into(&mut prepend),
            "LD_LIBRARY_PATH" => {
                env.set(k, v);
                v.clone_into(&mut ld_library_path);
            }
            _ => env.set(k, v),
        }
    }

    for (k, v) in runtime_env.iter() {
        match k {
            "PATH" => v.clone_into(&mut path),
            "APPEND_PATH" => v.clone_into(&mut append),
            "PREPEND_PATH" => v.clone_into(&mut prepend),
            "LD_LIBRARY_PATH" => v.clone_into(&mut ld_library_path),
            _ => env.set(k, v),
        }
    }

    let combined = [prepend.as_str(), path.as_str(), append.as_str()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(":");
    if combined.is_empty() {
        env.remove("PATH");
    } else {
        env.set("PATH", combined);
    }

    env.set("LD_LIBRARY_PATH", with_container_libs(&ld_library_path));

    env.to_env_list()
}

fn with_container_libs(ld_library_path: &str) -> String {
    if ld_library_path.split(':').any(|seg| seg == CONTAINER_LIBS) {
        ld_library_path.to_owned()
    } else if ld_library_path.is_empty() {
        CONTAINER_LIBS.to_owned()
    } else {
        format!("{ld_library_path}:{CONTAINER_LIBS}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    fn lookup<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
        env.iter().find_map(|e| {
            let (k, v) = e.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    #[test]
    fn map_replaces_in_place() {
        let mut env = EnvironmentMap::new();
        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "3");
        assert_eq!(env.to_env_list(), strings(&["A=3", "B=2"]));
    }

    #[test]
    fn map_remove_keeps_order() {
        let mut env: EnvironmentMap = [("A", "1"), ("B", "2"), ("C", "3")].into_iter().collect();
        assert_eq!(env.remove("A").as_deref(), Some("1"));
        env.set("C", "4");
        env.set("D", "5");
        assert_eq!(env.to_env_list(), strings(&["B=2", "C=4", "D=5"]));
    }

    #[test]
    fn image_env_only() {
        let image = strings(&["PATH=/usr/bin:/bin", "LANG=C"]);
        let env = resolve_process_env(&image, &EnvironmentMap::new());
        assert_eq!(
            env,
            strings(&[
                "PATH=/usr/bin:/bin",
                "LANG=C",
                "LD_LIBRARY_PATH=/.vessel.d/libs"
            ])
        );
    }

    #[test]
    fn explicit_value_overrides_image() {
        let image = strings(&["FOO=image"]);
        let runtime: EnvironmentMap = [("FOO", "explicit")].into_iter().collect();
        let env = resolve_process_env(&image, &runtime);
        assert_eq!(lookup(&env, "FOO"), Some("explicit"));
        assert_eq!(env.iter().filter(|e| e.starts_with("FOO=")).count(), 1);
    }

    #[test]
    fn append_and_prepend_path() {
        let image = strings(&["PATH=/a"]);
        let runtime: EnvironmentMap = [("APPEND_PATH", "/b"), ("PREPEND_PATH", "/c")]
            .into_iter()
            .collect();
        let env = resolve_process_env(&image, &runtime);
        assert_eq!(lookup(&env, "PATH"), Some("/c:/a:/b"));
        assert_eq!(lookup(&env, "APPEND_PATH"), None);
        assert_eq!(lookup(&env, "PREPEND_PATH"), None);
    }

    #[test]
    fn runtime_path_replaces_base() {
        let image = strings(&["HOME=/root", "PATH=/a", "TERM=xterm"]);
        let runtime: EnvironmentMap = [("PATH", "/x"), ("APPEND_PATH", "/y")]
            .into_iter()
            .collect();
        let env = resolve_process_env(&image, &runtime);
        assert_eq!(env[1], "PATH=/x:/y");
    }

    #[test]
    fn path_appended_when_image_has_none() {
        let runtime: EnvironmentMap = [("APPEND_PATH", "/b")].into_iter().collect();
        let env = resolve_process_env(&strings(&["A=1"]), &runtime);
        assert_eq!(
            env,
            strings(&["A=1", "PATH=/b", "LD_LIBRARY_PATH=/.vessel.d/libs"])
        );
    }

    #[test]
    fn empty_path_is_dropped() {
        let env = resolve_process_env(&strings(&["PATH="]), &EnvironmentMap::new());
        assert_eq!(lookup(&env, "PATH"), None);
    }

    #[test]
    fn ld_library_path_gets_libs_once() {
        let image = strings(&["LD_LIBRARY_PATH=/opt/lib"]);
        let env = resolve_process_env(&image, &EnvironmentMap::new());
        assert_eq!(
            lookup(&env, "LD_LIBRARY_PATH"),
            Some("/opt/lib:/.vessel.d/libs")
        );

        let again = resolve_process_env(&env, &EnvironmentMap::new());
        assert_eq!(
            lookup(&again, "LD_LIBRARY_PATH"),
            Some("/opt/lib:/.vessel.d/libs")
        );
    }

    #[test]
    fn ld_library_path_from_runtime_source() {
        let runtime: EnvironmentMap = [("LD_LIBRARY_PATH", "/.vessel.d/libs:/usr/lib64")]
            .into_iter()
            .collect();
        let env = resolve_process_env(&[], &runtime);
        assert_eq!(
            lookup(&env, "LD_LIBRARY_PATH"),
            Some("/.vessel.d/libs:/usr/lib64")
        );
    }

    #[test]
    fn precedence_of_runtime_sources() {
        let mut runtime = default_env("alpine.oci", "/tmp/bundle-1");
        runtime.merge(&prefixed_overrides(vec![
            ("VESSELENV_FOO".to_owned(), "prefixed".to_owned()),
            ("VESSEL_NAME_X".to_owned(), "ignored".to_owned()),
        ]));
        runtime.merge(&env_file_map(&["FOO=file", "BAR=file"]));
        runtime.merge(&[("BAR", "explicit")].into_iter().collect());

        let env = resolve_process_env(&strings(&["FOO=image"]), &runtime);
        assert_eq!(lookup(&env, "FOO"), Some("file"));
        assert_eq!(lookup(&env, "BAR"), Some("explicit"));
        assert_eq!(lookup(&env, "VESSEL_CONTAINER"), Some("/tmp/bundle-1"));
        assert_eq!(lookup(&env, "VESSEL_NAME"), Some("alpine.oci"));
        assert_eq!(lookup(&env, "NAME_X"), None);
    }

    #[test]
    fn prefixed_overrides_skip_bare_prefix() {
        let env = prefixed_overrides(vec![
            ("VESSELENV_".to_owned(), "x".to_owned()),
            ("VESSELENV_LANG".to_owned(), "C.UTF-8".to_owned()),
            ("LANG".to_owned(), "en_US".to_owned()),
        ]);
        assert_eq!(env.to_env_list(), strings(&["LANG=C.UTF-8"]));
    }

    #[test]
    fn env_file_blocklist() {
        let env = env_file_map(&[
            "HOME=/nowhere",
            "UID=0",
            "PWD=/x",
            "IFS=:",
            "OPTIND=2",
            "GID=0",
            "KEEP=1",
            "malformed",
        ]);
        assert_eq!(env.to_env_list(), strings(&["KEEP=1"]));
    }
}
