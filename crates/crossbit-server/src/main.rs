//! crossbit-server: hosts one handler module and serves it to a controller.
//!
//! Usage: crossbit-server --module <module> [--host <host>] [--port <port>] ...

use crossbit::PlatformInfo;
use crossbit::bootstrap;
use crossbit::logging::init_tracing;

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let registry = crossbit_server::registry();
    let code = bootstrap::run(&args, &registry, &PlatformInfo::current());
    std::process::exit(code);
}
