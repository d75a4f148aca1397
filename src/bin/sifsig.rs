use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sequoia_openpgp::cert::CipherSuite;

use sifsig::{
    display::{write_entity, write_signer},
    keygen::{KeyGenOptions, KeyPairGenerator, TerminalPrompt},
    keystore::{Fingerprint, KeyStore},
    sif::{
        arch_code, arch_name, DataObject, FsType, OpenMode, PartType, SifBuilder, SifImage,
        GROUP_MASK, UNUSED_LINK,
    },
    sign::{ByFingerprint, FixedPassphrase},
    ImageSigner, ImageVerifier,
};

/// sifsig
#[derive(Debug, Parser)]
#[clap(name = "sifsig", version)]
pub struct App {
    /// the key store directory, instead of ~/.sypgp
    #[clap(long)]
    keystore: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Suite {
    Rsa3k,
    Rsa4k,
    Cv25519,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Fs {
    Squash,
    Ext3,
    Immuobj,
    Raw,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Part {
    System,
    Primsys,
    Data,
    Overlay,
}

#[derive(Debug, Subcommand)]
enum KeysCommand {
    /// Lists the entities of the public (or secret) keyring
    List {
        #[clap(long)]
        secret: bool,
    },
    /// Generates a new key pair, asking for the identity on the terminal
    New {
        #[clap(long, value_enum, default_value = "rsa4k")]
        suite: Suite,
        /// protect the secret key with the password in this file
        #[clap(long)]
        passphrase_file: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Signs the primary partition of an image, generating a key pair if the store is empty
    Sign {
        image: PathBuf,
        /// the fingerprint of the key to sign with
        #[clap(long)]
        key: Option<String>,
        /// read the password for the secret key from this file
        #[clap(long)]
        passphrase_file: Option<PathBuf>,
    },
    /// Verifies the signature of an image against the public keyring
    Verify { image: PathBuf },
    /// Creates an image holding a single partition
    Create {
        output: PathBuf,
        #[clap(long)]
        partition: PathBuf,
        #[clap(long, value_enum, default_value = "squash")]
        fstype: Fs,
        #[clap(long, value_enum, default_value = "primsys")]
        parttype: Part,
        /// architecture name like amd64 or arm64 (default: the host's)
        #[clap(long)]
        arch: Option<String>,
    },
    /// Lists the data objects of an image
    List { image: PathBuf },
    /// Commands for dealing with the key store
    Keys {
        #[clap(subcommand)]
        cmd: KeysCommand,
    },
}

fn read_passphrase(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading passphrase file {}", path.display()))?;
    Ok(content.trim_end_matches(['\r', '\n']).to_string())
}

fn list(image: &SifImage) -> Result<()> {
    let header = image.header();
    println!("Container uuid: {}", hex::encode(header.uuid));
    println!("Arch: {}", arch_name(&header.arch));
    println!(
        "Descriptors: {} of {} free",
        header.dfree.get(),
        header.dtotal.get()
    );
    println!();
    println!(
        "{:<4} |{:<8} |{:<8} |{:<26} |TYPE",
        "ID", "GROUP", "LINK", "SIF POSITION (start-end)"
    );
    println!("{}", "-".repeat(72));

    for desc in image.descriptors() {
        let group = match desc.groupid.get() & !GROUP_MASK {
            0 => "NONE".to_string(),
            n => n.to_string(),
        };
        let link = match desc.link.get() {
            UNUSED_LINK => "NONE".to_string(),
            n => n.to_string(),
        };
        let (start, len) = desc.range();
        let kind = match desc.data_type() {
            Ok(datatype) => datatype.to_string(),
            Err(raw) => format!("unknown ({raw:#x})"),
        };
        println!(
            "{:<4} |{group:<8} |{link:<8} |{:<26} |{kind} {:?}",
            desc.id.get(),
            format!("{start}-{}", start + len),
            desc.name()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let store = match &args.keystore {
        Some(path) => KeyStore::open_path(path),
        None => KeyStore::open_user()?,
    };

    match args.cmd {
        Command::Sign {
            ref image,
            ref key,
            ref passphrase_file,
        } => {
            let mut signer = ImageSigner::new(&store);
            if let Some(key) = key {
                let fingerprint: Fingerprint =
                    key.parse().with_context(|| format!("invalid fingerprint {key:?}"))?;
                signer = signer.key_selector(ByFingerprint(fingerprint));
            }
            if let Some(path) = passphrase_file {
                signer = signer.credentials(FixedPassphrase::new(read_passphrase(path)?));
            }

            let outcome = signer.sign(image)?;
            if outcome.generated_key {
                println!("Generated new key pair {}", outcome.fingerprint);
            }
            println!(
                "Signed {} with key {} (object {})",
                image.display(),
                outcome.fingerprint,
                outcome.signature_id
            );
        }
        Command::Verify { ref image } => {
            let identity = ImageVerifier::new(&store).verify(image)?;
            write_signer(&mut std::io::stdout(), &identity)?;
        }
        Command::Create {
            ref output,
            ref partition,
            fstype,
            parttype,
            ref arch,
        } => {
            let data = fs::read(partition)
                .with_context(|| format!("reading partition {}", partition.display()))?;
            let fstype = match fstype {
                Fs::Squash => FsType::Squash,
                Fs::Ext3 => FsType::Ext3,
                Fs::Immuobj => FsType::ImmuObj,
                Fs::Raw => FsType::Raw,
            };
            let parttype = match parttype {
                Part::System => PartType::System,
                Part::Primsys => PartType::PrimSys,
                Part::Data => PartType::Data,
                Part::Overlay => PartType::Overlay,
            };

            let mut object = DataObject::partition(data, fstype, parttype);
            let mut builder = SifBuilder::new();
            if let Some(arch) = arch {
                let code = arch_code(arch)
                    .with_context(|| format!("unknown architecture {arch:?}"))?;
                object = object.with_arch(code);
                builder = builder.arch(code);
            }
            builder.add(object).write(output)?;
        }
        Command::List { ref image } => {
            let image = SifImage::load(image, OpenMode::ReadOnly)?;
            list(&image)?;
        }
        Command::Keys { cmd } => match cmd {
            KeysCommand::List { secret } => {
                let certs = if secret {
                    store.load_private()?
                } else {
                    store.load_public()?
                };
                let mut stdout = std::io::stdout().lock();
                for cert in &certs {
                    write_entity(&mut stdout, cert)?;
                }
                stdout.flush()?;
            }
            KeysCommand::New {
                suite,
                ref passphrase_file,
            } => {
                let options = KeyGenOptions {
                    cipher_suite: match suite {
                        Suite::Rsa3k => CipherSuite::RSA3k,
                        Suite::Rsa4k => CipherSuite::RSA4k,
                        Suite::Cv25519 => CipherSuite::Cv25519,
                    },
                    password: match passphrase_file {
                        Some(path) => Some(read_passphrase(path)?.into()),
                        None => None,
                    },
                };
                let cert = KeyPairGenerator::new(&store, options)
                    .generate(&mut TerminalPrompt::stdio())?;
                println!("{}", cert.fingerprint());
            }
        },
    }
    Ok(())
}
