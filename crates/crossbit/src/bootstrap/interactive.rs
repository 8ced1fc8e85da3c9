//! Line-oriented console for poking at handlers inside the worker binary.
//!
//! ```text
//! >>> modules
//! >>> load calculator scale=2
//! >>> call add [2, 3]
//! >>> get constant
//! ```

use std::io::{self, BufRead, Write};

use crate::bootstrap::args::parse_kwargs;
use crate::bridge::protocol::Fault;
use crate::handler::{HandlerContext, HandlerRegistry, Invoke, display_paths};
use crate::platform::PlatformInfo;
use crate::value::{Call, Value};
use crate::version::VersionInfo;

const HELP: &str = "\
Commands:
  help                          Show this help
  version                       Show version and platform
  modules                       List registered modules and their handlers
  path                          Show the module search path
  load <module> [k=v;k=v]       Construct the handler of <module>
  members                       List members of the loaded handler
  call <member> [args] [kwargs] Call a member; args is a JSON array, kwargs a JSON object
  get <member>                  Read a value member
  exit                          Leave the console";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Version,
    Modules,
    Path,
    Load { module: String, kwargs: String },
    Members,
    Call { member: String, call: Call },
    Exit,
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(w, r)| (w, r.trim()))
            .unwrap_or((line, ""));
        match word {
            "" => Ok(Self::Empty),
            "help" | "?" => Ok(Self::Help),
            "version" => Ok(Self::Version),
            "modules" => Ok(Self::Modules),
            "path" => Ok(Self::Path),
            "members" => Ok(Self::Members),
            "exit" | "quit" => Ok(Self::Exit),
            "load" => {
                let (module, kwargs) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                if module.is_empty() {
                    return Err("usage: load <module> [k=v;k=v]".to_string());
                }
                Ok(Self::Load {
                    module: module.to_string(),
                    kwargs: kwargs.trim().to_string(),
                })
            }
            "get" if !rest.is_empty() => Ok(Self::Call {
                member: rest.to_string(),
                call: Call::default(),
            }),
            "call" => {
                let (member, json) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                if member.is_empty() {
                    return Err("usage: call <member> [args] [kwargs]".to_string());
                }
                Ok(Self::Call {
                    member: member.to_string(),
                    call: parse_call(json)?,
                })
            }
            other => Err(format!("unknown command '{other}' (try 'help')")),
        }
    }
}

/// `[1, "a"] {"k": 2}`: both parts optional.
fn parse_call(json: &str) -> Result<Call, String> {
    let mut call = Call::default();
    let stream = serde_json::Deserializer::from_str(json).into_iter::<serde_json::Value>();
    for item in stream {
        match item.map_err(|e| format!("invalid JSON: {e}"))? {
            serde_json::Value::Array(args) if call.args.is_empty() && call.kwargs.is_empty() => {
                call.args = args.into_iter().map(Value::from).collect();
            }
            serde_json::Value::Object(kwargs) if call.kwargs.is_empty() => {
                call.kwargs = kwargs.into_iter().map(|(k, v)| (k, Value::from(v))).collect();
            }
            other => return Err(format!("unexpected argument {other}")),
        }
    }
    Ok(call)
}

/// Console state: the registry and the currently loaded handler.
pub struct Console<'a> {
    registry: &'a HandlerRegistry,
    ctx: HandlerContext,
    platform: &'a PlatformInfo,
    loaded: Option<Box<dyn Invoke>>,
}

impl<'a> Console<'a> {
    pub fn new(registry: &'a HandlerRegistry, ctx: HandlerContext, platform: &'a PlatformInfo) -> Self {
        Self {
            registry,
            ctx,
            platform,
            loaded: None,
        }
    }

    /// Execute one command. `Ok(None)` means exit.
    pub fn execute(&mut self, command: Command) -> Result<Option<String>, Fault> {
        let out = match command {
            Command::Empty => String::new(),
            Command::Exit => {
                if let Some(mut handler) = self.loaded.take() {
                    handler.shutdown_handler();
                }
                return Ok(None);
            }
            Command::Help => HELP.to_string(),
            Command::Version => VersionInfo::new()
                .with_platform(self.platform.clone())
                .to_string(),
            Command::Modules => self
                .registry
                .modules()
                .map(|(name, factories)| {
                    let types: Vec<&str> = factories.iter().map(|f| f.type_name()).collect();
                    if types.is_empty() {
                        format!("{name}: (no handler)")
                    } else {
                        format!("{name}: {}", types.join(", "))
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Command::Path => display_paths(self.ctx.search_path()),
            Command::Load { module, kwargs } => {
                let factory = self
                    .registry
                    .resolve(&module)
                    .map_err(|e| Fault::bare("ImportError", e.to_string()))?;
                let mut all = self.ctx.kwargs().clone();
                all.extend(parse_kwargs(&kwargs));
                let ctx = self.ctx.clone().with_kwargs(all);
                let handler = factory.construct(&ctx)?;
                let library = handler
                    .library()
                    .map(|lib| format!("{} ({})", lib.path().display(), lib.kind()))
                    .unwrap_or_else(|| "no library bound".to_string());
                if let Some(mut previous) = self.loaded.replace(handler) {
                    previous.shutdown_handler();
                }
                format!("loaded {} from '{module}': {library}", factory.type_name())
            }
            Command::Members => self.handler()?.member_names().join("\n"),
            Command::Call { member, call } => {
                let value = self.handler()?.invoke(&member, call)?;
                value.to_string()
            }
        };
        Ok(Some(out))
    }

    fn handler(&mut self) -> Result<&mut Box<dyn Invoke>, Fault> {
        self.loaded
            .as_mut()
            .ok_or_else(|| Fault::bare(Fault::RUNTIME_ERROR, "no handler loaded (use 'load <module>')"))
    }
}

/// Read commands from stdin until `exit` or end of input.
pub fn run(registry: &HandlerRegistry, ctx: HandlerContext, platform: &PlatformInfo) -> io::Result<()> {
    let mut console = Console::new(registry, ctx, platform);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    writeln!(stdout, "{}", VersionInfo::new().with_platform(platform.clone()))?;
    writeln!(stdout, "Type 'help' for a list of commands.")?;

    let mut lines = stdin.lock().lines();
    loop {
        write!(stdout, ">>> ")?;
        stdout.flush()?;
        let Some(line) = lines.next().transpose()? else {
            console.execute(Command::Exit).ok();
            writeln!(stdout)?;
            return Ok(());
        };
        let result = Command::parse(&line)
            .map_err(|message| Fault::bare("SyntaxError", message))
            .and_then(|command| console.execute(command));
        match result {
            Ok(Some(out)) if !out.is_empty() => writeln!(stdout, "{out}")?,
            Ok(Some(_)) => {}
            Ok(None) => return Ok(()),
            Err(fault) => writeln!(stdout, "{}: {}", fault.name, fault.message)?,
        }
    }
}
