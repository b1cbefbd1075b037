use std::fs;
use std::os::unix::io::IntoRawFd;
use std::path::Path;
use std::process;

use chrono::{Local, TimeZone};
use clap::Parser;
use serde_json::{Value, json};
use tracing::error;

use seismometer_toolbox::{
    cli::{ShepherdCli, ShepherdCommand},
    control,
    logging::{self, LogTarget},
    privilege,
    supervisor::Supervisor,
};

fn main() {
    let args = ShepherdCli::parse();
    install_panic_hook();
    if args.command.is_some() {
        client_main(&args)
    } else {
        supervisor_main(&args)
    }
}

/// Programming errors are logged with a stack representation before the
/// process dies.
fn install_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!("unhandled panic: {info}\n{backtrace}");
        default(info);
    }));
}

fn log_target(args: &ShepherdCli) -> LogTarget {
    if args.silent {
        LogTarget::Silent
    } else if args.syslog {
        LogTarget::Syslog
    } else if let Some(path) = &args.logging {
        LogTarget::File(path.clone())
    } else {
        LogTarget::Stderr
    }
}

fn supervisor_main(args: &ShepherdCli) -> ! {
    let Some(spec_path) = &args.daemons else {
        eprintln!("daemonshepherd: --daemons FILE is required in supervisor mode");
        process::exit(1);
    };

    if args.background
        && let Err(err) = daemonize()
    {
        eprintln!("daemonshepherd: failed to go into the background: {err}");
        process::exit(1);
    }

    if let Err(err) = logging::init(&log_target(args), "daemonshepherd") {
        eprintln!("daemonshepherd: failed to set up logging: {err}");
        process::exit(1);
    }

    if let Some(pid_file) = &args.pid_file
        && let Err(err) = write_pid_file(pid_file)
    {
        error!("failed to write pid file: {err}");
        eprintln!("daemonshepherd: failed to write pid file: {err}");
        process::exit(1);
    }

    let mut supervisor = match Supervisor::new(spec_path, args.socket.as_deref()) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("startup failed: {err}");
            eprintln!("daemonshepherd: {err}");
            remove_pid_file(args.pid_file.as_deref());
            process::exit(1);
        }
    };

    // Privileged setup (socket bind, spec validation) is done; become the
    // requested account before supervising anything.
    if let Err(err) =
        privilege::drop_privileges(args.user.as_deref(), args.group.as_deref())
    {
        error!("failed to drop privileges: {err}");
        eprintln!("daemonshepherd: {err}");
        remove_pid_file(args.pid_file.as_deref());
        process::exit(1);
    }

    let code = match supervisor.run() {
        Ok(()) => 0,
        Err(err) => {
            error!("supervisor failed: {err}");
            1
        }
    };
    // Unlink the control socket before the exit skips destructors.
    drop(supervisor);
    remove_pid_file(args.pid_file.as_deref());
    process::exit(code);
}

fn client_main(args: &ShepherdCli) -> ! {
    let Some(socket) = &args.socket else {
        eprintln!("daemonshepherd: --socket PATH is required in client mode");
        process::exit(1);
    };
    let command = args.command.as_ref().expect("client mode has a subcommand");

    let request = match command {
        ShepherdCommand::Reload => json!({"command": "reload"}),
        ShepherdCommand::List => json!({"command": "list"}),
        ShepherdCommand::Start { name } => {
            json!({"command": "start", "daemon": name})
        }
        ShepherdCommand::Stop { name } => json!({"command": "stop", "daemon": name}),
        ShepherdCommand::Restart { name } => {
            json!({"command": "restart", "daemon": name})
        }
        ShepherdCommand::CancelRestart { name } => {
            json!({"command": "cancel_restart", "daemon": name})
        }
        ShepherdCommand::ListCommands { name } => {
            json!({"command": "list-commands", "daemon": name})
        }
        ShepherdCommand::Command { name, command } => {
            json!({"command": "admin_command", "daemon": name, "admin_command": command})
        }
    };

    let reply = match control::send_request(socket, &request) {
        Ok(reply) => reply,
        Err(err) => {
            eprintln!("daemonshepherd: {err}");
            process::exit(1);
        }
    };

    if control::error_reason(&reply).is_some() {
        eprintln!("{reply}");
        process::exit(1);
    }

    match command {
        ShepherdCommand::List => render_list(&reply["result"]),
        ShepherdCommand::ListCommands { .. } => {
            if let Some(names) = reply["result"].as_array() {
                for name in names {
                    println!("{}", name.as_str().unwrap_or_default());
                }
            }
        }
        _ => {}
    }
    process::exit(0);
}

fn render_list(result: &Value) {
    let Some(rows) = result.as_array() else {
        return;
    };
    for row in rows {
        let daemon = row["daemon"].as_str().unwrap_or("?");
        if row["running"].as_bool().unwrap_or(false) {
            let pid = row["pid"].as_i64().unwrap_or(0);
            println!("{daemon}: running (pid {pid})");
        } else if let Some(at) = row["restart_at"].as_i64() {
            let when = Local
                .timestamp_opt(at, 0)
                .single()
                .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| at.to_string());
            println!("{daemon}: stopped (restart at {when})");
        } else {
            println!("{daemon}: stopped");
        }
    }
}

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", process::id()))
}

fn remove_pid_file(path: Option<&Path>) {
    if let Some(path) = path {
        let _ = fs::remove_file(path);
    }
}

fn daemonize() -> std::io::Result<()> {
    if unsafe { libc::fork() } > 0 {
        process::exit(0);
    }

    unsafe {
        libc::setsid();
    }

    if unsafe { libc::fork() } > 0 {
        process::exit(0);
    }

    std::env::set_current_dir("/")?;
    let devnull = fs::File::open("/dev/null")?;
    let fd = devnull.into_raw_fd();
    unsafe {
        let _ = libc::dup2(fd, libc::STDIN_FILENO);
        let _ = libc::dup2(fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(fd);
    }

    Ok(())
}
