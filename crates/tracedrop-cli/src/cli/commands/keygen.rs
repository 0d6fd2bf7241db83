//! `tracedrop keygen` - Generate a P-256 signing key.

use super::super::args::KeygenArgs;
use crate::exit_codes::SUCCESS;
use anyhow::{bail, Context, Result};
use tracedrop_core::config::{env_var_for, CloudCredentials, UserSecretKey, KEY_USER_SECRET_KEY};
use tracedrop_core::crypto::strip_pem_wrapper;
use tracedrop_core::OperatorKey;

pub fn run(args: KeygenArgs) -> Result<i32> {
    let Some((access_key_id, secret_access_key)) = args.credentials.split_once(',') else {
        bail!("expected <ACCESS_KEY_ID>,<SECRET>, got no comma");
    };
    if access_key_id.is_empty() || secret_access_key.is_empty() || secret_access_key.contains(',')
    {
        bail!("expected exactly <ACCESS_KEY_ID>,<SECRET>");
    }

    let secret = UserSecretKey {
        cloud: CloudCredentials {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
        },
        signing_key: OperatorKey::generate(),
    };
    let public_key = secret
        .signing_key
        .public_key_pem()
        .context("failed to encode public key")?;
    let encoded = secret.encode().context("failed to encode private key")?;

    println!(
        "Private key: {}={encoded}",
        env_var_for(KEY_USER_SECRET_KEY)
    );
    println!("Public key: {}", strip_pem_wrapper(&public_key));
    Ok(SUCCESS)
}
