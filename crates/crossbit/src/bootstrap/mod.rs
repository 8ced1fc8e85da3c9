//! Worker startup: parse the launch line, prepare the environment, construct
//! the handler, then serve the control channel.
//!
//! Every fatal problem is printed to stderr and turned into a non-zero exit
//! status before the listener is bound, so a controller polling the port sees
//! a dead process together with the reason.

mod args;
pub mod interactive;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use args::{
    DEFAULT_HOST, DEFAULT_PORT, LaunchArgs, ModuleRef, USAGE, format_kwargs, join_paths,
    parse_kwargs, search_path, split_paths,
};

use crate::bridge::channel::{
    RecoveryRecord, SessionFiles, remove_dir_if_exists, remove_file_if_exists,
};
use crate::bridge::protocol::{Fault, Metadata};
use crate::error::BootstrapError;
use crate::handler::{HandlerContext, HandlerRegistry, Invoke, ResolveError};
use crate::platform::PlatformInfo;
use crate::transport::http::{ServerConfig, bind, serve};
use crate::version::VersionInfo;
use crate::worker::{Dispatcher, WorkerService};

/// Run a worker binary. `argv` includes the program name. Returns the process
/// exit status.
pub fn run(argv: &[String], registry: &HandlerRegistry, platform: &PlatformInfo) -> i32 {
    let args = match LaunchArgs::parse(argv.get(1..).unwrap_or_default()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            eprintln!("{USAGE}");
            return e.exit_code();
        }
    };

    if args.help {
        println!("{USAGE}");
        return 0;
    }
    if args.version {
        println!("{}", VersionInfo::new().with_platform(platform.clone()));
        return 0;
    }

    match start(args, registry, platform) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Cannot start the worker.");
            e.exit_code()
        }
    }
}

fn start(
    args: LaunchArgs,
    registry: &HandlerRegistry,
    platform: &PlatformInfo,
) -> Result<(), BootstrapError> {
    let cwd = std::env::current_dir().map_err(|source| BootstrapError::Files {
        path: PathBuf::from("."),
        source,
    })?;

    // Environment changes happen here, before any runtime thread exists.
    extend_path_var(&args.append_environ_path, false);
    if !args.add_dll_directory.is_empty() {
        if !platform.supports_dll_directories() {
            return Err(BootstrapError::DllDirectoryUnsupported(platform.os.clone()));
        }
        extend_path_var(&args.add_dll_directory, true);
    }

    if args.interactive {
        let ctx = HandlerContext::new(Some(args.host.clone()), i32::from(args.port))
            .with_kwargs(args.kwargs.clone())
            .with_search_path(search_path(&cwd, None, &args.append_sys_path));
        return interactive::run(registry, ctx, platform)
            .map_err(|e| BootstrapError::Runtime(e.to_string()));
    }

    let module = ModuleRef::parse(args.module.as_deref().ok_or(BootstrapError::MissingModule)?)?;
    let search = search_path(&cwd, module.dir.as_deref(), &args.append_sys_path);

    let files = SessionFiles::for_address(&args.host, args.port);
    prepare_files(&files)?;

    let (handler, metadata) = match load(&args, &module, search, registry, &files) {
        Ok(loaded) => loaded,
        Err(e) => {
            discard_files(&files);
            return Err(e);
        }
    };
    let config = ServerConfig {
        host: args.host,
        port: args.port,
    };
    serve_blocking(config, handler, metadata)
}

/// Resolve and construct the handler for `module`.
fn load(
    args: &LaunchArgs,
    module: &ModuleRef,
    search: Vec<PathBuf>,
    registry: &HandlerRegistry,
    files: &SessionFiles,
) -> Result<(Box<dyn Invoke>, Metadata), BootstrapError> {
    let factory = registry.resolve(&module.name).map_err(|e| match e {
        ResolveError::UnknownModule(module) => BootstrapError::UnknownModule {
            module,
            search_path: search.clone(),
        },
        ResolveError::NoHandler(module) => BootstrapError::NoHandler(module),
        ResolveError::Ambiguous { module, types } => {
            BootstrapError::AmbiguousHandler { module, types }
        }
    })?;

    let ctx = HandlerContext::new(Some(args.host.clone()), i32::from(args.port))
        .with_kwargs(args.kwargs.clone())
        .with_search_path(search);
    let handler = construct(factory.type_name(), || factory.construct(&ctx))?;
    let library_path = handler
        .library()
        .map(|lib| lib.path().to_path_buf())
        .ok_or(BootstrapError::Unbound(factory.type_name()))?;

    tracing::info!(
        module = %module.name,
        handler = factory.type_name(),
        library = %library_path.display(),
        "Handler constructed"
    );

    let metadata = Metadata {
        library_path,
        pid: std::process::id(),
        resource_dir: files.resources.clone(),
    };
    Ok((handler, metadata))
}

/// Write the recovery record and create the resource directory.
fn prepare_files(files: &SessionFiles) -> Result<(), BootstrapError> {
    std::fs::create_dir_all(&files.resources).map_err(|source| BootstrapError::Files {
        path: files.resources.clone(),
        source,
    })?;
    let record = RecoveryRecord {
        pid: std::process::id(),
        resource_dir: files.resources.clone(),
    };
    record
        .write(&files.recovery)
        .map_err(|source| BootstrapError::Files {
            path: files.recovery.clone(),
            source,
        })
}

/// Remove the recovery record and resource directory after a failed start.
fn discard_files(files: &SessionFiles) {
    if let Err(e) = remove_file_if_exists(&files.recovery) {
        tracing::warn!(path = %files.recovery.display(), error = %e, "Failed to remove recovery file");
    }
    if let Err(e) = remove_dir_if_exists(&files.resources) {
        tracing::warn!(path = %files.resources.display(), error = %e, "Failed to remove resource directory");
    }
}

fn construct(
    type_name: &'static str,
    f: impl FnOnce() -> Result<Box<dyn Invoke>, Fault>,
) -> Result<Box<dyn Invoke>, BootstrapError> {
    f().map_err(|fault| {
        let hint = if fault.is(Fault::TYPE_ERROR) {
            constructor_hint(type_name)
        } else {
            String::new()
        };
        BootstrapError::Construct {
            type_name,
            fault,
            hint,
        }
    })
}

fn constructor_hint(type_name: &str) -> String {
    format!(
        "\nThe handler is constructed with\n\n    impl Handler for {type_name} {{\n        fn construct(ctx: &HandlerContext) -> Result<Self, Fault> {{ ... }}\n    }}\n\nCheck that every keyword argument it reads was passed with --kwargs and has the\nexpected format; constructor kwargs always arrive as strings."
    )
}

fn serve_blocking(
    config: ServerConfig,
    handler: Box<dyn Invoke>,
    metadata: Metadata,
) -> Result<(), BootstrapError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| BootstrapError::Runtime(e.to_string()))?;

    runtime.block_on(async move {
        let listener = bind(&config).await?;
        let service = Arc::new(WorkerService::new(Dispatcher::new(handler, metadata)));
        serve(listener, service)
            .await
            .map_err(|e| BootstrapError::Runtime(format!("{e:#}")))
    })
}

/// Append (or, for DLL directories, prepend) `dirs` to `PATH`.
fn extend_path_var(dirs: &[PathBuf], prepend: bool) {
    if dirs.is_empty() {
        return;
    }
    let current = std::env::var_os("PATH").unwrap_or_default();
    let Some(joined) = joined_path_var(&current, dirs, prepend) else {
        tracing::warn!("Cannot add directories containing the PATH separator");
        return;
    };
    // SAFETY: called from `start` before the tokio runtime (or any other
    // thread) is created.
    unsafe { std::env::set_var("PATH", joined) };
}

fn joined_path_var(current: &OsString, dirs: &[PathBuf], prepend: bool) -> Option<OsString> {
    let existing: Vec<PathBuf> = std::env::split_paths(current)
        .filter(|p| !p.as_os_str().is_empty())
        .collect();
    let added = dirs.iter().map(|d| absolute(d));
    let all: Vec<PathBuf> = if prepend {
        added.chain(existing).collect()
    } else {
        existing.into_iter().chain(added).collect()
    };
    std::env::join_paths(all).ok()
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
