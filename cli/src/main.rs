/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod commands;
use commands::{Invocation, help, run};
use env_logger::Builder;
use log::{LevelFilter, error};
use partedit::{Crc32ChunkPolicy, Error, FileBlockDevice, FlashConfig, Result, Session};
use std::path::PathBuf;
use std::process::ExitCode;

const DEVICE_ENV: &str = "PARTEDIT_DEVICE";

#[derive(Debug, Default)]
struct Options {
    device: Option<PathBuf>,
    block_size: Option<u32>,
    crc32_advances: bool,
    verbose: bool,
    command: Option<String>,
    args: Vec<String>,
}

fn parse_args(mut argv: impl Iterator<Item = String>) -> Result<Options> {
    let mut opts = Options::default();
    while let Some(arg) = argv.next() {
        if opts.command.is_some() {
            opts.args.push(arg);
            continue;
        }
        match arg.as_str() {
            "--device" => {
                let path = argv
                    .next()
                    .ok_or_else(|| Error::InvalidParameter("--device needs a path".to_string()))?;
                opts.device = Some(PathBuf::from(path));
            }
            "--block-size" => {
                let value = argv.next().ok_or_else(|| {
                    Error::InvalidParameter("--block-size needs a value".to_string())
                })?;
                let size = value.parse::<u32>().map_err(|_| {
                    Error::InvalidParameter(format!("'{}' is not a block size", value))
                })?;
                opts.block_size = Some(size);
            }
            "--crc32-advances" => opts.crc32_advances = true,
            "-v" | "--verbose" => opts.verbose = true,
            _ => opts.command = Some(arg),
        }
    }
    Ok(opts)
}

async fn execute(opts: Options, invocation: Invocation) -> Result<()> {
    let path = match opts.device {
        Some(path) => path,
        None => std::env::var_os(DEVICE_ENV).map(PathBuf::from).ok_or_else(|| {
            Error::InvalidParameter(format!("No device given, use --device or {}", DEVICE_ENV))
        })?,
    };

    let mut config = FlashConfig::default();
    if opts.crc32_advances {
        config = config.with_crc32_policy(Crc32ChunkPolicy::Advance);
    }

    let mut device = FileBlockDevice::new(&path, opts.block_size.unwrap_or(512));
    device.open().await?;

    let mut session = Session::new(config)?;
    session.locate(vec![device])?;
    session.init_partitions(None).await?;

    let result = run(&mut session, &invocation).await;
    if let Some(mut device) = session.into_device() {
        device.close().await?;
    }
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = match parse_args(std::env::args().skip(1)) {
        Ok(opts) => opts,
        Err(e) => {
            println!("{}", e);
            return ExitCode::from(e.status_code());
        }
    };

    Builder::new()
        .filter_level(if opts.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .init();

    let Some(word) = opts.command.clone() else {
        print!("{}", help());
        return ExitCode::from(Error::InvalidParameter(String::new()).status_code());
    };

    let invocation = match Invocation::parse(&word, opts.args.clone()) {
        Ok(invocation) => invocation,
        Err(e) => {
            println!("{}", e);
            print!("{}", help());
            return ExitCode::from(e.status_code());
        }
    };

    let label = invocation.label();
    match execute(opts, invocation).await {
        Ok(()) => {
            println!("{} passed.", label);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            println!("{} failed: {}", label, e);
            ExitCode::from(e.status_code())
        }
    }
}
