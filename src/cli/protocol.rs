//! `tunwatch protocol get|set|clear`

use tunwatch_core::error::EngineError;
use tunwatch_core::types::Protocol;

pub fn run_protocol_get() -> Result<(), EngineError> {
    let prober = super::file_prober()?;
    match prober.preferred_protocol() {
        Some(protocol) => println!("Preferred protocol: {}", protocol),
        None => println!("No preferred protocol (default fallback order)"),
    }
    Ok(())
}

pub fn run_protocol_set(protocol: Protocol) -> Result<(), EngineError> {
    super::file_prober()?.set_preferred_protocol(Some(protocol))?;
    println!("✓ {} will be tried first", protocol);
    Ok(())
}

pub fn run_protocol_clear() -> Result<(), EngineError> {
    super::file_prober()?.set_preferred_protocol(None)?;
    println!("✓ Preferred protocol cleared");
    Ok(())
}
