use exitcode::{self, ExitCode};

use std::process;

use splitroute_lib::command::{Request, Response};
use splitroute_lib::socket;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    let req = Request::from(&args.command);
    let resp = match socket::process_request(&args.socket_path, &req).await {
        Ok(resp) => resp,
        Err(socket::Error::ServiceNotRunning) => {
            eprintln!("SplitRoute service is not running at {}", args.socket_path.display());
            process::exit(exitcode::UNAVAILABLE);
        }
        Err(e) => {
            eprintln!("Error processing {}: {}", req.action, e);
            process::exit(exitcode::IOERR);
        }
    };

    let exit = if args.command.json() {
        print_json(&resp)
    } else {
        pretty_print(&resp)
    };
    process::exit(exit);
}

fn print_json(resp: &Response) -> ExitCode {
    match serde_json::to_string_pretty(resp) {
        Ok(json) => {
            println!("{json}");
            exit_code(resp)
        }
        Err(e) => {
            eprintln!("Error formatting response: {e}");
            exitcode::SOFTWARE
        }
    }
}

fn pretty_print(resp: &Response) -> ExitCode {
    if let Some(data) = &resp.data {
        println!("{data}");
    }
    match (&resp.message, resp.success) {
        (Some(msg), true) => println!("{msg}"),
        (Some(msg), false) => eprintln!("Error: {msg}"),
        (None, false) => eprintln!("Error: request failed"),
        (None, true) => (),
    }
    exit_code(resp)
}

fn exit_code(resp: &Response) -> ExitCode {
    if resp.success { exitcode::OK } else { exitcode::SOFTWARE }
}
