use std::error::Error;
use std::process;

use rehistory as rh;

fn main() {
    let opts = match rh::opts::parse_args() {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("{err}");
            let mut source = err.source();
            while let Some(cause) = source {
                eprintln!("Caused by: {cause}");
                source = cause.source();
            }
            process::exit(2);
        }
    };
    if let Err(err) = rh::run(&opts) {
        eprintln!("{err}");
        let mut source = err.source();
        while let Some(cause) = source {
            eprintln!("Caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}
