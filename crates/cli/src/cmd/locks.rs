//! Implementation of the `cairn locks` command.

use anyhow::{Context, Result};
use serde::Serialize;

use cairn_lib::lock::{LockOwner, LockState};
use cairn_lib::store::EntryKind;

use super::{KindArg, StoreArgs, kinds};
use crate::output::{OutputFormat, lock_state_name, print_info, print_json, print_lock};

#[derive(Serialize)]
struct LockOutput<'a> {
  kind: EntryKind,
  key: &'a str,
  state: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  owner: Option<&'a LockOwner>,
  /// Whether the recorded owner process has exited; only known on its host.
  #[serde(skip_serializing_if = "Option::is_none")]
  owner_dead: Option<bool>,
}

impl<'a> LockOutput<'a> {
  fn new(kind: EntryKind, key: &'a str, state: &'a LockState) -> Self {
    let owner = match state {
      LockState::Free => None,
      LockState::Held(owner) => owner.as_ref(),
      LockState::Stale(owner) => Some(owner),
    };
    Self {
      kind,
      key,
      state: lock_state_name(state),
      owner,
      owner_dead: owner.map(LockOwner::is_dead),
    }
  }
}

pub fn cmd_locks(args: &StoreArgs, kind: Option<KindArg>, output: OutputFormat) -> Result<()> {
  let store = args.open_store()?;

  let mut locks = Vec::new();
  for kind in kinds(kind) {
    let found = store.locks(kind).with_context(|| format!("Failed to list {kind} locks"))?;
    locks.extend(found.into_iter().map(|(key, state)| (kind, key, state)));
  }

  if output.is_json() {
    let rows: Vec<LockOutput<'_>> = locks
      .iter()
      .map(|(kind, key, state)| LockOutput::new(*kind, key, state))
      .collect();
    return print_json(&rows);
  }

  if locks.is_empty() {
    print_info("No locks");
    return Ok(());
  }
  for (kind, key, state) in &locks {
    print_lock(*kind, key, state);
  }
  Ok(())
}
