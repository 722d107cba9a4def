//! The checker policies built on the dataflow core.
//!
//! Each checker registers a state identity, a default state, and the event
//! subscriptions it needs. Registration happens once, before the walker
//! starts; after that a checker is only ever driven through its hooks.

use once_cell::sync::Lazy;

use crate::debug_println;
use crate::hooks::{AnalysisCtx, Dispatcher};
use crate::state::RegistryError;

pub mod deref_check;
pub mod safe_pointers;

/// Environment switch gating the safe-pointer discipline checker. Off by
/// default; most code bases do not use the safe qualifier at all.
pub const CHECK_SAFE_ENV: &str = "PTRFLOW_CHECK_SAFE";

static CHECK_SAFE: Lazy<bool> = Lazy::new(|| std::env::var_os(CHECK_SAFE_ENV).is_some());

/// Register the stock checker set. The deref-before-check detector is always
/// on; the safe-pointer checker only joins when its environment switch is
/// set, and registers no subscriptions otherwise.
pub fn register_default_checkers(
    ctx: &mut AnalysisCtx,
    disp: &mut Dispatcher,
) -> Result<(), RegistryError> {
    deref_check::register(ctx, disp)?;
    if *CHECK_SAFE {
        debug_println!("DEBUG: {} set, enabling safe-pointer checks", CHECK_SAFE_ENV);
        safe_pointers::register(ctx, disp)?;
    }
    Ok(())
}
