extern crate pkcs11_context;

use pkcs11_context::cli::{self, options::Options};

fn main() {
    let options = Options::from_args();

    if let Err(err) = cli::init_logging(options.log_level) {
        eprintln!("Failed to set up logging: {}", err);
        ::std::process::exit(1);
    }

    if let Err(err) = cli::run(options) {
        eprintln!("{}", err);
        ::std::process::exit(1);
    }
}
