//! The command line options.

use std::{fmt, path::PathBuf, str::FromStr};

use clap::Parser;
use log::LevelFilter;

use crate::{hash::HashAlgorithm, keys::ec::Curve};

//------------ Options -------------------------------------------------------

/// The command line options for the pkcs11-context tool.
#[derive(clap::Parser)]
#[command(version, about = "Manage keys on a PKCS#11 token.")]
pub struct Options {
    /// The JSON or TOML file with the library and token configuration.
    #[arg(short, long, env = "PKCS11_CONTEXT_CONFIG")]
    pub config: PathBuf,

    /// The level to log at: off, error, warn, info, debug or trace.
    #[arg(
        short, long,
        env = "PKCS11_CONTEXT_LOG_LEVEL",
        default_value = "warn",
        value_parser = parse_log_level,
    )]
    pub log_level: LevelFilter,

    #[command(subcommand)]
    pub command: Command,
}

impl Options {
    /// Creates the options from the process arguments.
    ///
    /// If the arguments won't result in usable options, exits the process.
    pub fn from_args() -> Self {
        Self::parse()
    }
}

fn parse_log_level(s: &str) -> Result<LevelFilter, String> {
    LevelFilter::from_str(s).map_err(|_| format!("invalid log level '{}'", s))
}

//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand)]
pub enum Command {
    /// Show the selected token and the state of the session pool.
    Info,

    /// Generate a key pair on the token.
    Generate(GenerateArgs),

    /// Sign a digest with a key pair on the token.
    Sign(SignArgs),

    /// Delete a key pair from the token.
    Delete(KeyArgs),
}

//------------ KeyArgs -------------------------------------------------------

/// Selects a key pair on the token.
#[derive(clap::Args)]
pub struct KeyArgs {
    /// The CKA_ID of the key pair, in hex.
    #[arg(long, required_unless_present = "label")]
    pub id: Option<HexBytes>,

    /// The CKA_LABEL of the key pair.
    #[arg(long)]
    pub label: Option<String>,
}

impl KeyArgs {
    pub fn id(&self) -> Option<&[u8]> {
        self.id.as_ref().map(|id| id.0.as_slice())
    }

    pub fn label(&self) -> Option<&[u8]> {
        self.label.as_ref().map(|label| label.as_bytes())
    }
}

//------------ GenerateArgs --------------------------------------------------

#[derive(clap::Args)]
pub struct GenerateArgs {
    /// The CKA_ID for the new key pair, in hex.
    #[arg(long)]
    pub id: HexBytes,

    /// The CKA_LABEL for the new key pair.
    #[arg(long)]
    pub label: Option<String>,

    #[arg(long, value_enum, default_value_t = KeyAlgorithm::Rsa)]
    pub algorithm: KeyAlgorithm,

    /// The size of the modulus of an RSA key, or of the prime p of new DSA parameters.
    #[arg(long, default_value_t = 2048)]
    pub bits: u32,

    /// The curve of an EC key.
    #[arg(long, default_value = "P-256")]
    pub curve: Curve,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Dsa,
}

//------------ SignArgs ------------------------------------------------------

#[derive(clap::Args)]
pub struct SignArgs {
    #[command(flatten)]
    pub key: KeyArgs,

    /// The digest to sign, in hex.
    #[arg(long)]
    pub digest: HexBytes,

    /// The hash algorithm that produced the digest.
    #[arg(long, default_value = "sha256")]
    pub hash: HashAlgorithm,
}

//------------ HexBytes ------------------------------------------------------

/// A byte string given in hex on the command line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HexBytes(pub Vec<u8>);

impl FromStr for HexBytes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|err| format!("invalid hex string '{}': {}", s, err))?;
        if bytes.is_empty() {
            return Err("empty hex string".to_string());
        }
        Ok(HexBytes(bytes))
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sign_command() {
        let options = Options::try_parse_from([
            "pkcs11-context",
            "--config",
            "token.toml",
            "sign",
            "--label",
            "signing",
            "--digest",
            "00ff",
            "--hash",
            "sha-1",
        ])
        .unwrap();

        assert_eq!(PathBuf::from("token.toml"), options.config);
        assert_eq!(LevelFilter::Warn, options.log_level);
        match options.command {
            Command::Sign(args) => {
                assert_eq!(None, args.key.id());
                assert_eq!(Some(&b"signing"[..]), args.key.label());
                assert_eq!(vec![0x00, 0xff], args.digest.0);
                assert_eq!(HashAlgorithm::Sha1, args.hash);
            }
            _ => panic!("expected sign command"),
        }
    }

    #[test]
    fn parse_generate_command() {
        let options = Options::try_parse_from([
            "pkcs11-context",
            "-c",
            "token.json",
            "-l",
            "debug",
            "generate",
            "--id",
            "0102",
            "--algorithm",
            "ec",
            "--curve",
            "P-384",
        ])
        .unwrap();

        assert_eq!(LevelFilter::Debug, options.log_level);
        match options.command {
            Command::Generate(args) => {
                assert_eq!(HexBytes(vec![1, 2]), args.id);
                assert_eq!(KeyAlgorithm::Ec, args.algorithm);
                assert_eq!(Curve::P384, args.curve);
                assert_eq!(2048, args.bits);
            }
            _ => panic!("expected generate command"),
        }

        let options = Options::try_parse_from([
            "pkcs11-context", "-c", "token.json", "generate", "--id", "03", "--algorithm", "dsa", "--bits", "1024",
        ])
        .unwrap();
        match options.command {
            Command::Generate(args) => {
                assert_eq!(KeyAlgorithm::Dsa, args.algorithm);
                assert_eq!(1024, args.bits);
            }
            _ => panic!("expected generate command"),
        }
    }

    #[test]
    fn reject_bad_arguments() {
        assert!(Options::try_parse_from(["pkcs11-context", "-c", "t.toml", "delete"]).is_err());
        assert!(Options::try_parse_from(["pkcs11-context", "-c", "t.toml", "delete", "--id", "xyz"]).is_err());
        assert!(Options::try_parse_from(["pkcs11-context", "-c", "t.toml", "-l", "loud", "info"]).is_err());
    }
}
