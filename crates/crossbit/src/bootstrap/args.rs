//! The worker's launch command line.
//!
//! The controller builds it with [`LaunchArgs::to_command_line`] and the
//! worker reads it back with [`LaunchArgs::parse`]; both sides share this
//! type so the two can't drift apart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::BootstrapError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

/// Separator for list-valued flags and kwargs pairs.
const LIST_SEP: char = ';';

pub const USAGE: &str = "\
Usage: crossbit-server [OPTIONS]

Start a crossbit worker that hosts a handler module.

Options:
  -m, --module <module>           Handler module to host
  -H, --host <host>               Address to bind [default: 127.0.0.1]
  -p, --port <port>               Port to bind [default: 8080]
  -s, --append-sys-path <paths>   ';'-separated directories appended to the module search path
  -e, --append-environ-path <paths>
                                  ';'-separated directories appended to PATH
  -d, --add-dll-directory <paths> ';'-separated DLL directories (Windows only)
  -k, --kwargs <pairs>            ';'-separated key=value pairs passed to the handler constructor
  -i, --interactive               Start an interactive console
  -v, --version                   Print version information and exit
  -h, --help                      Print this help and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    pub module: Option<String>,
    pub host: String,
    pub port: u16,
    pub append_sys_path: Vec<PathBuf>,
    pub append_environ_path: Vec<PathBuf>,
    pub add_dll_directory: Vec<PathBuf>,
    pub kwargs: BTreeMap<String, String>,
    pub interactive: bool,
    pub version: bool,
    pub help: bool,
}

impl Default for LaunchArgs {
    fn default() -> Self {
        Self {
            module: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            append_sys_path: Vec::new(),
            append_environ_path: Vec::new(),
            add_dll_directory: Vec::new(),
            kwargs: BTreeMap::new(),
            interactive: false,
            version: false,
            help: false,
        }
    }
}

impl LaunchArgs {
    /// Parse arguments, not including `argv[0]`.
    pub fn parse(args: &[String]) -> Result<Self, BootstrapError> {
        let mut parsed = Self::default();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            let flag = arg.as_str();
            let mut value = |flag: &str| {
                iter.next()
                    .cloned()
                    .ok_or_else(|| BootstrapError::Usage(format!("{flag} requires a value")))
            };
            match flag {
                "-m" | "--module" => parsed.module = Some(value(flag)?),
                "-H" | "--host" => parsed.host = value(flag)?,
                "-p" | "--port" => {
                    let raw = value(flag)?;
                    parsed.port = raw
                        .parse()
                        .map_err(|_| BootstrapError::Usage(format!("invalid port: {raw}")))?;
                }
                "-s" | "--append-sys-path" => {
                    parsed.append_sys_path.extend(split_paths(&value(flag)?))
                }
                "-e" | "--append-environ-path" => {
                    parsed.append_environ_path.extend(split_paths(&value(flag)?))
                }
                "-d" | "--add-dll-directory" => {
                    parsed.add_dll_directory.extend(split_paths(&value(flag)?))
                }
                "-k" | "--kwargs" => parsed.kwargs.extend(parse_kwargs(&value(flag)?)),
                "-i" | "--interactive" => parsed.interactive = true,
                "-v" | "--version" => parsed.version = true,
                "-h" | "--help" => parsed.help = true,
                other if other.starts_with('-') => {
                    return Err(BootstrapError::Usage(format!("unknown flag: {other}")));
                }
                other => {
                    return Err(BootstrapError::Usage(format!("unexpected argument: {other}")));
                }
            }
        }

        Ok(parsed)
    }

    /// The arguments that reproduce `self` when parsed.
    pub fn to_command_line(&self) -> Vec<String> {
        let mut line = Vec::new();
        if let Some(module) = &self.module {
            line.extend(["--module".to_string(), module.clone()]);
        }
        line.extend(["--host".to_string(), self.host.clone()]);
        line.extend(["--port".to_string(), self.port.to_string()]);
        for (flag, paths) in [
            ("--append-sys-path", &self.append_sys_path),
            ("--append-environ-path", &self.append_environ_path),
            ("--add-dll-directory", &self.add_dll_directory),
        ] {
            if !paths.is_empty() {
                line.extend([flag.to_string(), join_paths(paths)]);
            }
        }
        if !self.kwargs.is_empty() {
            line.extend(["--kwargs".to_string(), format_kwargs(&self.kwargs)]);
        }
        if self.interactive {
            line.push("--interactive".to_string());
        }
        line
    }
}

pub fn split_paths(raw: &str) -> Vec<PathBuf> {
    raw.split(LIST_SEP)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

pub fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(&LIST_SEP.to_string())
}

/// `a=1;b=x` -> `{a: "1", b: "x"}`. Splits at the first `=`; a key without
/// `=` maps to an empty value; empty keys are dropped.
pub fn parse_kwargs(raw: &str) -> BTreeMap<String, String> {
    raw.split(LIST_SEP)
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn format_kwargs(kwargs: &BTreeMap<String, String>) -> String {
    kwargs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(&LIST_SEP.to_string())
}

/// A module reference split into its directory and module name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub dir: Option<PathBuf>,
    pub name: String,
}

impl ModuleRef {
    pub fn parse(reference: &str) -> Result<Self, BootstrapError> {
        if reference.starts_with('.') {
            return Err(BootstrapError::RelativeImport(reference.to_string()));
        }
        let path = Path::new(reference);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| reference.to_string());
        let name = name.strip_suffix(".rs").unwrap_or(&name).to_string();
        if name.is_empty() {
            return Err(BootstrapError::Usage(format!(
                "invalid module reference: {reference}"
            )));
        }
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        Ok(Self { dir, name })
    }
}

/// Search path: working directory, module directory, then extra entries,
/// without duplicates.
pub fn search_path(cwd: &Path, module_dir: Option<&Path>, extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    let candidates = std::iter::once(cwd.to_path_buf())
        .chain(module_dir.map(|d| cwd.join(d)))
        .chain(extra.iter().map(|p| cwd.join(p)));
    for candidate in candidates {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults() {
        let parsed = LaunchArgs::parse(&[]).unwrap();
        assert_eq!(parsed.host, "127.0.0.1");
        assert_eq!(parsed.port, 8080);
        assert!(parsed.module.is_none());
    }

    #[test]
    fn short_and_long_flags() {
        let parsed = LaunchArgs::parse(&args(&[
            "-m", "calculator", "-H", "localhost", "--port", "9001", "-s", "/a;/b", "-k",
            "x=1;y=hello",
        ]))
        .unwrap();
        assert_eq!(parsed.module.as_deref(), Some("calculator"));
        assert_eq!(parsed.host, "localhost");
        assert_eq!(parsed.port, 9001);
        assert_eq!(parsed.append_sys_path, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(parsed.kwargs["x"], "1");
        assert_eq!(parsed.kwargs["y"], "hello");
    }

    #[test]
    fn usage_errors() {
        assert!(matches!(
            LaunchArgs::parse(&args(&["--port"])),
            Err(BootstrapError::Usage(_))
        ));
        assert!(matches!(
            LaunchArgs::parse(&args(&["--port", "http"])),
            Err(BootstrapError::Usage(_))
        ));
        assert!(matches!(
            LaunchArgs::parse(&args(&["--bogus"])),
            Err(BootstrapError::Usage(_))
        ));
    }

    #[test]
    fn command_line_parses_back() {
        let mut original = LaunchArgs {
            module: Some("/opt/handlers/calculator.rs".into()),
            host: "127.0.0.1".into(),
            port: 50123,
            append_sys_path: vec![PathBuf::from("/opt/libs")],
            append_environ_path: vec![PathBuf::from("/opt/bin"), PathBuf::from("/usr/local/bin")],
            ..Default::default()
        };
        original.kwargs.insert("scale".into(), "2.5".into());
        original.kwargs.insert("name".into(), "pump".into());

        let parsed = LaunchArgs::parse(&original.to_command_line()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn kwargs_split_at_first_equals() {
        let kwargs = parse_kwargs("expr=a=b; flag ;=orphan; k = v ");
        assert_eq!(kwargs["expr"], "a=b");
        assert_eq!(kwargs["flag"], "");
        assert_eq!(kwargs["k"], "v");
        assert_eq!(kwargs.len(), 3);
    }

    #[test]
    fn module_reference_forms() {
        assert_eq!(
            ModuleRef::parse("calculator").unwrap(),
            ModuleRef {
                dir: None,
                name: "calculator".into()
            }
        );
        assert_eq!(
            ModuleRef::parse("handlers/calculator.rs").unwrap(),
            ModuleRef {
                dir: Some(PathBuf::from("handlers")),
                name: "calculator".into()
            }
        );
        assert!(matches!(
            ModuleRef::parse(".calculator"),
            Err(BootstrapError::RelativeImport(_))
        ));
    }

    #[test]
    fn search_path_is_deduplicated_and_ordered() {
        let path = search_path(
            Path::new("/work"),
            Some(Path::new("handlers")),
            &[PathBuf::from("/opt/libs"), PathBuf::from("/work")],
        );
        assert_eq!(
            path,
            vec![
                PathBuf::from("/work"),
                PathBuf::from("/work/handlers"),
                PathBuf::from("/opt/libs"),
            ]
        );
    }
}
