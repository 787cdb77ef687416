//! `burrow change-passphrase`

use super::Context;
use crate::helpers::Location;
use crate::key::InteractivePassphrase;
use clap::Args;

#[derive(Args)]
pub struct ChangePassphraseArgs {
    /// Repository whose key is re-sealed
    pub repository: Location,
}

pub fn run(args: ChangePassphraseArgs, context: &Context) -> anyhow::Result<bool> {
    let mut repository = context.open_repository(&args.repository, false)?;
    let (_manifest, mut key) = context.load_manifest(&mut repository)?;
    key.change_passphrase(&mut InteractivePassphrase)?;
    Ok(true)
}
