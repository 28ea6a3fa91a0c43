//! The pkcs11-context command line tool.

pub mod options;

use std::io;

use log::LevelFilter;

use crate::{
    context::Pkcs11Context,
    error::Error,
    keys::{KeyPair, Signer, dsa::DsaParameters},
    provider::pkcs11::Pkcs11Provider,
};

use self::options::{Command, GenerateArgs, KeyAlgorithm, KeyArgs, Options, SignArgs};

/// Sets up logging to stderr at the given level.
pub fn init_logging(log_level: LevelFilter) -> Result<(), log::SetLoggerError> {
    fern_logger(log_level).chain(io::stderr()).apply()
}

fn fern_logger(log_level: LevelFilter) -> fern::Dispatch {
    let show_target = log_level == LevelFilter::Trace || log_level == LevelFilter::Debug;
    fern::Dispatch::new()
        .format(move |out, message, record| {
            if show_target {
                out.finish(format_args!(
                    "{} [{}] [{}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.target(),
                    message
                ))
            } else {
                out.finish(format_args!(
                    "{} [{}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    message
                ))
            }
        })
        .level(log_level)
        .level_for("cryptoki", log_level.min(LevelFilter::Warn))
}

/// Runs the command given in the options and prints its outcome to stdout.
pub fn run(options: Options) -> Result<(), Error> {
    let context = Pkcs11Context::open_from_file(&options.config)?;
    let res = match options.command {
        Command::Info => info(&context),
        Command::Generate(args) => generate(&context, &args),
        Command::Sign(args) => sign(&context, &args),
        Command::Delete(args) => delete(&context, &args),
    };
    let closed = context.close();
    res.and(closed)
}

fn info(context: &Pkcs11Context) -> Result<(), Error> {
    let token = context.token();
    println!("Slot:         {}", token.slot_id);
    println!("Label:        {}", token.label);
    println!("Serial:       {}", token.serial_number);
    println!("Model:        {}", token.model);
    println!("Manufacturer: {}", token.manufacturer);
    println!("R/W sessions: {}", token.max_rw_sessions);
    println!("Pool:         {}", context.pool_state());
    Ok(())
}

fn generate(context: &Pkcs11Context, args: &GenerateArgs) -> Result<(), Error> {
    let label = args.label.as_ref().map(|label| label.as_bytes());
    let key = match args.algorithm {
        KeyAlgorithm::Rsa => KeyPair::Rsa(context.generate_rsa_key_pair(&args.id.0, label, args.bits)?),
        KeyAlgorithm::Ec => KeyPair::Ec(context.generate_ec_key_pair(&args.id.0, label, args.curve)?),
        KeyAlgorithm::Dsa => {
            let params = DsaParameters::generate(args.bits)?;
            KeyPair::Dsa(context.generate_dsa_key_pair(&args.id.0, label, &params)?)
        }
    };
    print_public_key(&key)
}

fn sign(context: &Pkcs11Context, args: &SignArgs) -> Result<(), Error> {
    let key = find_key_pair(context, &args.key)?;
    let signature = key.sign(&args.digest.0, args.hash)?;
    println!("{}", hex::encode(signature));
    Ok(())
}

fn delete(context: &Pkcs11Context, args: &KeyArgs) -> Result<(), Error> {
    let key = find_key_pair(context, args)?;
    let id = hex::encode(key.private_key().id());
    key.delete()?;
    println!("Deleted key pair {}", id);
    Ok(())
}

fn find_key_pair<'c>(context: &'c Pkcs11Context, args: &KeyArgs) -> Result<KeyPair<'c, Pkcs11Provider>, Error> {
    context
        .find_key_pair(args.id(), args.label())?
        .ok_or_else(|| Error::KeyNotFound("no key pair matches the given id and label".to_string()))
}

fn print_public_key(key: &KeyPair<'_, Pkcs11Provider>) -> Result<(), Error> {
    let pem = key.public_key().public_key_to_pem()?;
    println!("Id: {}", hex::encode(key.private_key().id()));
    print!("{}", String::from_utf8_lossy(&pem));
    Ok(())
}
