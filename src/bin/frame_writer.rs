//! Writes two length-prefixed frames, `Hello` and `World!`, 100 ms apart.

use std::io::{self, Write};
use std::{thread, time::Duration};

use procpipe::frame::encode_frame;

fn main() -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    out.write_all(&encode_frame(b"Hello"))?;
    out.flush()?;

    thread::sleep(Duration::from_millis(100));

    out.write_all(&encode_frame(b"World!"))?;
    out.flush()
}
