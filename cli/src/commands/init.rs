// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `pop init`

use super::{block_on, CommandContext};
use anyhow::Result;
use pop_core::application::hierarchy::initialize;

pub fn run(ctx: &CommandContext, admin_identity: Option<String>) -> Result<()> {
    let identity = admin_identity.unwrap_or_else(|| ctx.config.namespace.admin_identity.clone());
    block_on(async {
        let store = ctx.connect().await?;
        let result = initialize(store.as_ref(), &ctx.namespace, &identity, ctx.force).await;
        store.close().await?;
        Ok(result?)
    })
}
