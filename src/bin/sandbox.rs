// SPDX-License-Identifier: Apache-2.0

//! `nvclaim-sandbox` — run a command with selected /dev entries hidden.

use std::env;
use std::process;

use log::error;
use nvclaim::sandbox;

fn usage() {
    eprintln!("Usage: nvclaim-sandbox <device names...> -- <command> [args]");
    eprintln!();
    eprintln!("Runs the command in a private mount+PID namespace in which the");
    eprintln!("named /dev entries do not exist.");
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        usage();
        process::exit(1);
    }

    let parsed = match sandbox::parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("nvclaim-sandbox: {e:#}");
            usage();
            process::exit(1);
        }
    };

    match sandbox::run(&parsed) {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("sandbox setup failed: {e:#}");
            process::exit(1);
        }
    }
}
