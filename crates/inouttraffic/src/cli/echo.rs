//! `echo` subcommand: raw echo traffic on every FPGA of every board.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use inouttraffic_lib::echo::EchoSession;
use inouttraffic_lib::packet::StreamLinkFactory;
use inouttraffic_lib::protocol::APP_MODE_ECHO;
use inouttraffic_lib::scan;

use super::{EchoOutput, RUNNING, Result, TrafficError, checked_config, usb_discovery};

/// Pause when no board is available.
const IDLE_SLEEP: Duration = Duration::from_millis(500);

pub(super) fn cmd_echo(rounds: Option<u64>, json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = checked_config(config_path)?;
    let desc = config.descriptor();
    let mut discovery = usb_discovery(&config);
    let mut rng = rand::thread_rng();

    let mut list = scan::init_scan(&mut discovery, &desc, &StreamLinkFactory, &mut rng)?;
    let ready = list.set_app_mode(APP_MODE_ECHO);
    if !json {
        println!("{ready} board(s) in echo mode");
        println!(
            "Writing to each FPGA of each board and reading back, random length writes ({}-{})",
            config.echo_min_len, config.echo_max_len
        );
        println!("Press Ctrl+C to stop.");
    }

    let mut session = EchoSession::new(config.echo_min_len, config.echo_max_len);
    let start = Instant::now();

    while RUNNING.load(Ordering::SeqCst) {
        if rounds.is_some_and(|n| session.stats().rounds >= n) {
            break;
        }

        match scan::timely_scan(&mut discovery, &list, &desc, &StreamLinkFactory, &mut rng) {
            Ok(mut added) => {
                let found = added.set_app_mode(APP_MODE_ECHO);
                if found > 0 && !json {
                    println!("Found {found} new board(s)");
                }
                list.merge(added);
            }
            // Enumeration hiccups are retried on the next scan
            Err(TrafficError::Transport(e)) => log::warn!("timely scan: {e}"),
            Err(e) => return Err(e),
        }

        if list.count() == 0 {
            if !json {
                print!("x");
                std::io::stdout().flush().ok();
            }
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }

        session.round(&mut list, &mut rng);
        list.prune();
    }

    let secs = start.elapsed().as_secs_f64();
    let stats = session.stats();

    if json {
        let output = EchoOutput {
            elapsed_secs: secs,
            mb_written: stats.mb_written(),
            mb_read: stats.mb_read(),
            rate_mb_s: stats.rate(secs),
            stats: stats.clone(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).map_err(std::io::Error::other)?
        );
        return Ok(());
    }

    println!();
    println!(
        "{:.2} MB write, {:.2} MB read, rate {:.2} MB/s, partial reads {}",
        stats.mb_written(),
        stats.mb_read(),
        stats.rate(secs),
        stats.partial_reads
    );
    Ok(())
}
