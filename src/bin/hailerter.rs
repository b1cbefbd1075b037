use std::process;

use chrono::{Local, TimeZone};
use clap::Parser;
use serde_json::{Value, json};
use tracing::error;

use seismometer_toolbox::{
    alerter::Alerter,
    cli::{HailerterCli, HailerterCommand},
    constants::{DEFAULT_FLAP_THRESHOLD, DEFAULT_FLAP_WINDOW},
    control,
    logging::{self, LogTarget},
    tracker::TrackerOptions,
};

fn main() {
    let args = HailerterCli::parse();
    install_panic_hook();
    if args.command.is_some() {
        client_main(&args)
    } else {
        tracker_main(&args)
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

fn tracker_options(args: &HailerterCli) -> TrackerOptions {
    TrackerOptions {
        skip_initial_error: args.skip_initial_error,
        remind_interval: args.remind_interval.map(|seconds| seconds as i64),
        warning_expected: args.warning_expected,
        default_interval: args.default_interval.map(|seconds| seconds as i64),
        missing: args.missing,
        flap_window: args.flapping_window.unwrap_or(DEFAULT_FLAP_WINDOW),
        flap_threshold: args.flapping_threshold.unwrap_or(DEFAULT_FLAP_THRESHOLD),
    }
}

fn tracker_main(args: &HailerterCli) -> ! {
    if let Err(err) = logging::init(&LogTarget::Stderr, "hailerter") {
        eprintln!("hailerter: failed to set up logging: {err}");
        process::exit(1);
    }

    let mut alerter =
        match Alerter::new(tracker_options(args), args.socket.as_deref()) {
            Ok(alerter) => alerter,
            Err(err) => {
                error!("startup failed: {err}");
                eprintln!("hailerter: {err}");
                process::exit(1);
            }
        };

    let result = alerter.run();
    // Unlink the control socket before the exit skips destructors.
    drop(alerter);
    match result {
        Ok(()) => process::exit(0),
        Err(err) => {
            error!("tracker failed: {err}");
            process::exit(1);
        }
    }
}

/// Parses the `<location-json>` client argument; it must be an object of
/// string tags.
fn parse_location(raw: &str) -> Value {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("hailerter: invalid location '{raw}': {err}");
            process::exit(1);
        }
    };
    if !parsed.is_object() {
        eprintln!("hailerter: location must be a JSON object");
        process::exit(1);
    }
    parsed
}

fn client_main(args: &HailerterCli) -> ! {
    let Some(socket) = &args.socket else {
        eprintln!("hailerter: --socket PATH is required in client mode");
        process::exit(1);
    };
    let command = args.command.as_ref().expect("client mode has a subcommand");

    let request = match command {
        HailerterCommand::List => json!({"command": "list"}),
        HailerterCommand::ListMuted => json!({"command": "list_muted"}),
        HailerterCommand::Forget { aspect, location } => json!({
            "command": "forget",
            "aspect": aspect,
            "location": parse_location(location),
        }),
        HailerterCommand::Mute {
            aspect,
            location,
            duration,
        } => json!({
            "command": "mute",
            "aspect": aspect,
            "location": parse_location(location),
            "duration": duration,
        }),
        HailerterCommand::Unmute { aspect, location } => json!({
            "command": "unmute",
            "aspect": aspect,
            "location": parse_location(location),
        }),
        HailerterCommand::ResetFlapping { aspect, location } => json!({
            "command": "reset_flapping",
            "aspect": aspect,
            "location": parse_location(location),
        }),
        HailerterCommand::ResetReminder { aspect, location } => json!({
            "command": "reset_reminder",
            "aspect": aspect,
            "location": parse_location(location),
        }),
    };

    let reply = match control::send_request(socket, &request) {
        Ok(reply) => reply,
        Err(err) => {
            eprintln!("hailerter: {err}");
            process::exit(1);
        }
    };

    if control::error_reason(&reply).is_some() {
        eprintln!("{reply}");
        process::exit(1);
    }

    match command {
        HailerterCommand::List => {
            if let Some(rows) = reply["result"].as_array() {
                for row in rows {
                    println!("{row}");
                }
            }
        }
        HailerterCommand::ListMuted => render_muted(&reply["result"]),
        _ => {}
    }
    process::exit(0);
}

fn render_muted(result: &Value) {
    let Some(rows) = result.as_array() else {
        return;
    };
    for row in rows {
        let aspect = row[0].as_str().unwrap_or("?");
        let location = &row[1];
        let expires = row[2].as_i64().unwrap_or(0);
        let until = Local
            .timestamp_opt(expires, 0)
            .single()
            .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| expires.to_string());
        println!("{aspect} {location} muted until {until}");
    }
}
