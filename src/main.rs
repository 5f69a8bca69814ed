use std::{
    env,
    error::Error,
    fs,
    io::{self, Read, Stderr, Stdout, Write},
    process, thread,
    time::Duration,
};

use crossbeam::channel::{self, Receiver, TryRecvError};
use lazy_static::lazy_static;

use procpipe::{Process, SpawnOptions};

lazy_static! {
    static ref STDOUT: Stdout = io::stdout();
    static ref STDERR: Stderr = io::stderr();
}

const USAGE: &str = "usage: procpipe [--options FILE] PROGRAM [ARGS...]";
const OUTPUT_POLL: Duration = Duration::from_millis(20);
const DRAIN_BUDGET: Duration = Duration::from_secs(1);

fn init_logging() {
    match env::var("PROCPIPE_LOG") {
        Ok(path) => {
            if let Err(e) = simple_logging::log_to_file(&path, log::LevelFilter::Debug) {
                eprintln!("cannot log to {}: {}", path, e);
            }
        }
        Err(_) => simple_logging::log_to_stderr(log::LevelFilter::Warn),
    }
}

/// Copies our own stdin to a channel. Reading it blocks, so it gets a
/// thread; the child is still driven from the main thread only.
fn stdin_relay() -> Receiver<Vec<u8>> {
    let (sender, receiver) = channel::bounded::<Vec<u8>>(16);
    thread::spawn(move || {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut buf = [0u8; 4096];
        loop {
            match input.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sender.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    receiver
}

fn emit(out: &mut dyn Write, data: &[u8]) -> io::Result<()> {
    if !data.is_empty() {
        out.write_all(data)?;
        out.flush()?;
    }
    Ok(())
}

fn relay(child: &mut Process, input: &Receiver<Vec<u8>>) -> Result<i32, Box<dyn Error + Send + Sync>> {
    let mut input_open = true;
    loop {
        if input_open {
            match input.try_recv() {
                Ok(data) => {
                    let written = child.write(&data);
                    if written < data.len() {
                        log::warn!("Child accepted {} of {} bytes", written, data.len());
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    child.close_stdin();
                    input_open = false;
                }
            }
        }

        let out = child.read_stdout(None, Some(OUTPUT_POLL))?;
        emit(&mut STDOUT.lock(), &out)?;
        let err = child.read_stderr(None, Some(Duration::from_millis(0)))?;
        emit(&mut STDERR.lock(), &err)?;

        if out.is_empty() && err.is_empty() {
            // nothing captured or nothing new: wait on the child instead
            if child.wait_timeout(OUTPUT_POLL)?.is_some() {
                break;
            }
        } else if !child.is_running() {
            break;
        }
    }

    emit(&mut STDOUT.lock(), &child.read_all_stdout(Some(DRAIN_BUDGET))?)?;
    emit(&mut STDERR.lock(), &child.read_all_stderr(Some(DRAIN_BUDGET))?)?;
    Ok(child.wait()?)
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    init_logging();

    let mut options = SpawnOptions::new().stdin(true).stdout(true).stderr(true);
    let mut program = None;
    let mut args = Vec::new();
    let mut argv = env::args().skip(1);
    while let Some(arg) = argv.next() {
        if program.is_none() && arg == "--options" {
            let path = argv.next().ok_or(USAGE)?;
            options = SpawnOptions::from_json(&fs::read_to_string(path)?)?;
        } else if program.is_none() {
            program = Some(arg);
        } else {
            args.push(arg);
        }
    }
    let program = program.ok_or(USAGE)?;

    let mut child = Process::spawn(&program, &args, &options)?;
    let input = stdin_relay();
    let code = relay(&mut child, &input)?;
    child.close();

    process::exit(code)
}
