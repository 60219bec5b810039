// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

use std::path::PathBuf;

use clap::Parser;
use embermq::config::Config;
use embermq::error::Error;
use embermq::{log, server};

#[derive(Parser, Debug)]
#[command(name = "embermqd", version, about = "An MQTT 3.1/3.1.1/5 broker")]
struct Cli {
    /// Path to a TOML config file. Falls back to built-in defaults when
    /// omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Parse the config file and exit without starting the broker.
    #[arg(short, long)]
    test: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if cli.test {
        println!("configuration is valid");
        return Ok(());
    }

    log::init_log(&config.log);
    server::run(config).await
}
