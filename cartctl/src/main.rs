// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use clap::Parser;
#[cfg(unix)]
use std::os::unix::process::CommandExt;

use cartctl::clock::RealClock;
use cartctl::console;
use cartctl::detect;
use cartctl::device::Locator;
use cartctl::ops::{self, OpOptions};
use cartctl::options::{Action, Cli};
use cartctl::rpc::SkunkRpcProtocol;
use cartctl::stubs::{DumperStub, FlasherStub};
use cartctl::tool::Tool;
use cartctl::usb::RusbFactory;

/// Stub binaries are opaque blobs out of this crate's scope; a real build
/// embeds them via `include_bytes!` and sizes the placeholder accordingly.
const STUB_PLACEHOLDER_LEN: usize = 4096;

/// The dump preamble's universal header and standard-values blocks are
/// likewise opaque; a real build embeds the bytes a working image needs.
const DUMP_UNIVERSAL_HEADER: &[u8] = &[];
const DUMP_STANDARD_VALUES: &[u8] = &[];

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    } else if cli.quiet {
        builder.filter_level(log::LevelFilter::Error);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();

    if !cli.quiet {
        println!("cartctl - Skunkboard cartridge control tool");
    }

    run(&cli).context("cartctl failed")
}

/// Execs `path` in place of this process, matching the source's
/// `_execlp`-and-never-return handoff to a user-supplied console shell.
fn exec_external_console(path: &std::path::Path) -> Result<()> {
    log::info!("starting external console {}", path.display());
    #[cfg(unix)]
    {
        let err = std::process::Command::new(path).exec();
        bail!("could not exec external console {}: {err}", path.display());
    }
    #[cfg(not(unix))]
    {
        let status = std::process::Command::new(path)
            .status()
            .with_context(|| format!("could not launch external console {}", path.display()))?;
        std::process::exit(status.code().unwrap_or(1));
    }
}

fn run(cli: &Cli) -> Result<()> {
    if let Some(path) = &cli.external_console {
        return exec_external_console(path);
    }

    let clock = RealClock;
    let factory = RusbFactory::new(cli.timeout(), cli.select_serial);
    let locator = Locator::new(factory, &clock);

    let mut tool = Tool::open(locator, &clock, cli.timeout(), cli.usb_bus, cli.usb_port)
        .context("failed to open device")?;
    tool.ensure_fresh_session().context("checking for a stale transfer")?;

    let opts = OpOptions {
        bank2: cli.bank2,
        six_meg: cli.six_meg,
        slow_flash: cli.slow_flash,
        erase_all: cli.erase_all,
        flash_active: cli.flash,
    };

    match cli.action() {
        Action::SerialInfo => {
            let clock = RealClock;
            match tool.with_reattach(|t| ops::serial_info(t, &clock))? {
                Some(info) => {
                    println!(
                        "Boot version {:02x}.{:02x}.{:02x}, Serial {:04x}",
                        info.bios_version.0, info.bios_version.1, info.bios_version.2, info.serial
                    );
                }
                None => {
                    println!("Falling back to legacy serial query via console.");
                    let mut protocol = SkunkRpcProtocol::new();
                    tool.with_reattach(|t| console::run(t, &mut protocol, || true))?;
                }
            }
        }
        Action::SerialBanner => {
            let clock = RealClock;
            match tool.with_reattach(|t| ops::serial_info(t, &clock))? {
                Some(info) => {
                    for row in ops::serial_banner_text(&info) {
                        println!("{row}");
                    }
                }
                None => bail!("serial banner unavailable on this board revision"),
            }
        }
        Action::Reset => {
            tool.with_reattach(ops::reset)?;
        }
        Action::BootOnly => {
            let (base, _) = cli.parse_positional()?;
            let base = base.unwrap_or(0x4000);
            let entry = (base | ops::entry_address_modifier(cli.bank2, cli.six_meg)) as i32;
            tool.with_reattach(|t| t.send_payload(&[], base, entry, false, opts.flash_active, opts.bank2, false))?;
            if cli.console {
                enter_console(&mut tool)?;
            }
        }
        Action::Dump => {
            let (_, file) = cli.parse_positional()?;
            let path = file.context("dump requires an output filename")?;
            let dumper = DumperStub::placeholder(STUB_PLACEHOLDER_LEN);
            tool.with_reattach(|t| {
                ops::dump(
                    t,
                    std::path::Path::new(path),
                    DUMP_UNIVERSAL_HEADER,
                    DUMP_STANDARD_VALUES,
                    &dumper,
                    cli.bank2,
                )
            })?;
        }
        Action::Flash => {
            let (base_override, file) = cli.parse_positional()?;
            let path = file.context("flash requires a filename")?;
            let data = std::fs::read(path).with_context(|| format!("reading {path}"))?;
            let mut detection = detect::detect(&data, path, cli.override_base, cli.header_skip)?;
            if let Some(base) = base_override {
                detection.base = base;
            }

            let flasher = FlasherStub::placeholder(STUB_PLACEHOLDER_LEN);
            tool.with_reattach(|t| ops::flash(t, &flasher, data.len(), &opts))?;

            let flash_opts = OpOptions {
                flash_active: true,
                ..opts
            };
            tool.with_reattach(|t| ops::upload(t, &data, &detection, cli.no_boot, cli.console, &flash_opts))?;
        }
        Action::Upload => {
            if cli.bios_upgrade {
                let bios_rev1: &[u8] = &[];
                let bios_rev2or3: &[u8] = &[];
                let message =
                    ops::bios_upgrade(&mut tool, cli.override_flash, cli.bios_force(), bios_rev1, bios_rev2or3)?;
                println!("{message}");
                return Ok(());
            }

            let (base_override, file) = cli.parse_positional()?;
            let path = file.context("no filename given")?;
            let data = std::fs::read(path).with_context(|| format!("reading {path}"))?;
            let mut detection = detect::detect(&data, path, cli.override_base, cli.header_skip)?;
            if let Some(base) = base_override {
                detection.base = base;
            }

            tool.with_reattach(|t| ops::upload(t, &data, &detection, cli.no_boot, cli.console, &opts))?;
        }
    }

    Ok(())
}

fn enter_console<F, C>(tool: &mut Tool<'_, F, C>) -> Result<()>
where
    F: cartctl::device::DeviceFactory,
    C: cartctl::clock::Clock,
{
    let mut protocol = SkunkRpcProtocol::new();
    tool.with_reattach(|t| console::run(t, &mut protocol, || true))
        .context("console loop failed")
}
