use anyhow::{Context, Result};
use clap::Parser;
use rln_membership_sync::{
    ethereum::{format_address, parse_contract_address},
    keystore::{
        KeystoreFile, MembershipContract, MembershipCredentials, MembershipGroup,
        DEFAULT_KEYSTORE_PASSWORD, DEFAULT_KEYSTORE_PATH,
    },
    AppInfo, IdentityCredential,
};
use std::collections::HashSet;
use std::path::PathBuf;

/// Generates identity credentials and seals them into an RLN keystore.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = DEFAULT_KEYSTORE_PATH)]
    output: PathBuf,

    #[arg(short, long, default_value = DEFAULT_KEYSTORE_PASSWORD)]
    password: String,

    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    #[arg(long)]
    chain_id: u64,

    #[arg(long)]
    contract: String,

    /// Tree index of the first generated credential
    #[arg(long, default_value_t = 0)]
    start_index: u64,
}

fn check_duplicates(credentials: &[IdentityCredential]) -> bool {
    let unique: HashSet<_> = credentials.iter().map(|c| c.id_commitment).collect();
    unique.len() == credentials.len()
}

fn main() -> Result<()> {
    let args = Args::parse();
    let contract = parse_contract_address(&args.contract)?;
    let app_info = AppInfo::rln_relay();

    let mut keystore = KeystoreFile::load_or_new(&args.output, &app_info)
        .with_context(|| format!("Failed to open keystore {}", args.output.display()))?;

    println!("Generating {} identity credentials...", args.count);
    let mut rng = rand::thread_rng();
    let identities: Vec<IdentityCredential> = (0..args.count)
        .map(|_| IdentityCredential::generate(&mut rng))
        .collect();

    if !check_duplicates(&identities) {
        return Err(anyhow::anyhow!("Generated duplicate id commitments"));
    }

    let membership_contract = MembershipContract::new(args.chain_id, &contract);
    for (offset, identity) in identities.iter().enumerate() {
        let credential = MembershipCredentials {
            identity_credential: identity.clone(),
            membership_groups: vec![MembershipGroup {
                membership_contract: membership_contract.clone(),
                tree_index: args.start_index + offset as u64,
            }],
        };
        keystore
            .add_credential(&credential, &args.password)
            .context("Failed to seal credential")?;
    }

    println!("Writing keystore to {}...", args.output.display());
    keystore
        .save(&args.output)
        .context("Failed to write keystore")?;

    println!(
        "Keystore now holds {} credentials for {} on chain {}",
        keystore.credentials.len(),
        format_address(&contract),
        membership_contract.chain_id
    );
    println!("First commitments:");
    for (i, identity) in identities.iter().take(5).enumerate() {
        println!(
            "  {}: {}",
            args.start_index + i as u64,
            hex::encode(identity.id_commitment)
        );
    }

    Ok(())
}
