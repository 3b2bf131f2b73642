/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, info};
use partedit::disk::utilities::hexdump;
use partedit::{BlockDevice, Error, Result, Session};
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, EnumIter, EnumString};

#[derive(EnumString, EnumIter, AsRefStr, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum Command {
    #[strum(to_string = "-d", serialize = "/d")]
    Dump,
    Read,
    Flash,
    Erase,
    Reset,
    Save,
    Write,
}

impl Command {
    pub fn usage(&self) -> &'static str {
        match self {
            Command::Dump => "-d                                  (Dump parent disk info)",
            Command::Read => "read <partition> <offset> <size>",
            Command::Flash => "flash <partition> <file>",
            Command::Erase => "erase <partition>",
            Command::Reset => "reset                               (Erase GPT table)",
            Command::Save => "save <offset> <size> <file>",
            Command::Write => "write <offset> <size> <file>",
        }
    }

    pub fn arg_count(&self) -> usize {
        match self {
            Command::Dump | Command::Reset => 0,
            Command::Erase => 1,
            Command::Flash => 2,
            Command::Read | Command::Save | Command::Write => 3,
        }
    }
}

pub fn help() -> String {
    let mut text = String::from("\nUEFI-style partition editor.\n\nUsage: partedit [--device PATH] [--block-size N] [--crc32-advances] [-v] <command>\n\nCommands:\n");
    for command in Command::iter() {
        text.push_str("  ");
        text.push_str(command.usage());
        text.push('\n');
    }
    text.push_str("\nOffsets and sizes are hexadecimal.\n");
    text
}

/// A command word plus its positional arguments, checked for arity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Command,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn parse(word: &str, args: Vec<String>) -> Result<Self> {
        let command = Command::from_str(word)
            .map_err(|_| Error::InvalidParameter(format!("Unknown command '{}'", word)))?;
        if args.len() != command.arg_count() {
            return Err(Error::InvalidParameter(format!(
                "'{}' takes {} arguments, got {}",
                command.as_ref(),
                command.arg_count(),
                args.len()
            )));
        }
        Ok(Self { command, args })
    }

    /// Text used in the passed/failed line printed after the command.
    pub fn label(&self) -> String {
        match self.command {
            Command::Dump => "Dump parent device".to_string(),
            Command::Read => format!("Read partition {}", self.args[0]),
            Command::Flash => format!("Flash partition {}", self.args[0]),
            Command::Erase => format!("Erase partition: {}", self.args[0]),
            Command::Reset => "Erase GPT table".to_string(),
            Command::Save => "Save disk data".to_string(),
            Command::Write => "Write disk data".to_string(),
        }
    }
}

/// Parses a hex number with an optional `0x` prefix.
pub fn parse_hex(value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16)
        .map_err(|_| Error::InvalidParameter(format!("'{}' is not a hex number", value)))
}

fn parse_size(value: &str) -> Result<usize> {
    usize::try_from(parse_hex(value)?)
        .map_err(|_| Error::InvalidParameter(format!("size '{}' is too large", value)))
}

fn progress_logger(what: &'static str) -> impl FnMut(usize, usize) + Send {
    let mut last_percent = usize::MAX;
    move |done: usize, total: usize| {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        if percent != last_percent {
            debug!("{}: {}% ({:#X}/{:#X})", what, percent, done, total);
            last_percent = percent;
        }
    }
}

pub async fn run<D: BlockDevice>(session: &mut Session<D>, invocation: &Invocation) -> Result<()> {
    let args = &invocation.args;
    match invocation.command {
        Command::Dump => {
            print!("{}", session.dump()?);
        }
        Command::Read => {
            let offset = parse_hex(&args[1])?;
            let size = parse_size(&args[2])?;
            let data = session.read_partition(&args[0], offset, size).await?;
            print!("{}", hexdump(2, offset as usize, &data));
        }
        Command::Flash => {
            let image = read_file(&args[1]).await?;
            info!("Loaded {} ({:#X} bytes)", args[1], image.len());
            let mut progress = progress_logger("Flash");
            session.flash(&args[0], &image, &mut progress).await?;
        }
        Command::Erase => {
            let mut progress = progress_logger("Erase");
            session.erase(&args[0], &mut progress).await?;
        }
        Command::Reset => {
            session.reset().await?;
        }
        Command::Save => {
            let offset = parse_hex(&args[0])?;
            let size = parse_size(&args[1])?;
            let data = session.save(offset, size).await?;
            tokio::fs::write(&args[2], &data).await?;
        }
        Command::Write => {
            let offset = parse_hex(&args[0])?;
            let size = parse_size(&args[1])?;
            let data = read_file(&args[2]).await?;
            session.write_raw(offset, size, &data).await?;
        }
    }
    Ok(())
}

async fn read_file(path: &str) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        Error::Device(std::io::Error::new(
            e.kind(),
            format!("Open file {} failed: {}", path, e),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use partedit::{FlashConfig, MemoryBlockDevice};

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn command_words_are_case_insensitive() {
        assert_eq!(Command::from_str("FLASH").unwrap(), Command::Flash);
        assert_eq!(Command::from_str("Erase").unwrap(), Command::Erase);
        assert_eq!(Command::from_str("-d").unwrap(), Command::Dump);
        assert_eq!(Command::from_str("/D").unwrap(), Command::Dump);
        assert_eq!(Command::Dump.as_ref(), "-d");
        assert_eq!(Command::Save.as_ref(), "save");
        assert!(Command::from_str("format").is_err());
    }

    #[test]
    fn arity_is_checked() {
        assert!(Invocation::parse("reset", vec![]).is_ok());
        assert!(matches!(
            Invocation::parse("read", args(&["boot", "0"])),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            Invocation::parse("nuke", vec![]),
            Err(Error::InvalidParameter(_))
        ));
        let inv = Invocation::parse("erase", args(&["boot"])).unwrap();
        assert_eq!(inv.label(), "Erase partition: boot");
    }

    #[test]
    fn hex_values() {
        assert_eq!(parse_hex("0x200").unwrap(), 0x200);
        assert_eq!(parse_hex("1000").unwrap(), 0x1000);
        assert_eq!(parse_hex("ffFF").unwrap(), 0xFFFF);
        assert!(matches!(parse_hex("0xzz"), Err(Error::InvalidParameter(_))));
        assert!(parse_hex("").is_err());
    }

    #[test]
    fn help_lists_every_command() {
        let text = help();
        for command in Command::iter() {
            assert!(text.contains(command.usage()));
        }
    }

    #[tokio::test]
    async fn write_then_save_through_commands() {
        let dir = std::env::temp_dir();
        let input = dir.join(format!("partedit-cli-{}-in.bin", std::process::id()));
        let output = dir.join(format!("partedit-cli-{}-out.bin", std::process::id()));
        tokio::fs::write(&input, b"0123456789").await.unwrap();

        let mut session = Session::open(MemoryBlockDevice::new(512, 16), FlashConfig::default()).unwrap();
        let write = Invocation::parse(
            "write",
            args(&["0x10", "4", input.to_str().unwrap()]),
        )
        .unwrap();
        run(&mut session, &write).await.unwrap();

        let save = Invocation::parse(
            "SAVE",
            args(&["0x10", "0x6", output.to_str().unwrap()]),
        )
        .unwrap();
        run(&mut session, &save).await.unwrap();
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"0123\0\0");

        let read = Invocation::parse("read", args(&["boot", "0", "10"])).unwrap();
        assert!(matches!(run(&mut session, &read).await, Err(Error::NoGpt(_))));

        tokio::fs::remove_file(&input).await.unwrap();
        tokio::fs::remove_file(&output).await.unwrap();
    }
}
