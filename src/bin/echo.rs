//! Byte-echo child used by the integration tests.
//!
//! Copies stdin to stdout until EOF. `--stderr` mirrors every chunk to
//! stderr as well, `--exit CODE` sets the exit status.

use std::io::{self, Read, Write};
use std::process;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut mirror = false;
    let mut code = 0;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stderr" => mirror = true,
            "--exit" => code = args.next().ok_or("--exit needs a code")?.parse()?,
            other => return Err(format!("unknown argument {}", other).into()),
        }
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let stderr = io::stderr();
    let mut input = stdin.lock();
    let mut output = stdout.lock();
    let mut buf = [0u8; 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
        output.flush()?;
        if mirror {
            let mut err = stderr.lock();
            err.write_all(&buf[..n])?;
            err.flush()?;
        }
    }

    process::exit(code)
}
