//! Client-side FIDO2/CTAP2 library.
//!
//! Talks to hardware authenticators over the CTAPHID framing protocol,
//! drives the CTAP2 request/response state machine, and implements the
//! pinUvAuthProtocol (versions 1 and 2) on top. The entry points are
//! [`list_devices`] to find authenticators, [`Session`] to open one, and
//! the workflow modules for the actual operations:
//!
//! - [`cred::make_credential`] and [`assertion::get_assertion`] for the
//!   two webauthn primitives,
//! - [`pin`] for PIN setup, change and token acquisition,
//! - [`mgmt`], [`bio`], [`blob`] and [`config`] for authenticator
//!   management.
//!
//! ```no_run
//! use fido2_client as fido;
//!
//! fido::init(fido::FLAG_DEBUG);
//! let devices = fido::list_devices()?;
//! let mut dev = fido::Session::new();
//! dev.open(&devices[0].path)?;
//! let assertions = fido::assertion::get_assertion(
//!     &mut dev,
//!     &fido::assertion::GetAssertionArgs {
//!         rp_id: "example.com".into(),
//!         client_data_hash: [0u8; 32],
//!         ..Default::default()
//!     },
//! )?;
//! # Ok::<(), fido::Error>(())
//! ```
//!
//! All I/O is synchronous: each command blocks the calling thread until
//! the authenticator replies or the session timeout expires. Sessions
//! are not internally synchronized; share one across threads only under
//! external mutual exclusion.

use std::sync::Once;

pub mod assertion;
pub mod bio;
pub mod blob;
pub mod cbor;
pub mod config;
pub mod cred;
pub mod error;
pub mod hid;
pub mod info;
pub mod mgmt;
pub mod pin;
pub mod session;
pub mod transport;
pub mod u2f;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
pub use info::AuthenticatorInfo;
pub use session::Session;
pub use transport::{
    list_devices, register_provider, DeviceInfo, DeviceProvider, HidapiProvider, Transport,
};

/// Enables log output (also triggered by the `FIDO_DEBUG` environment
/// variable).
pub const FLAG_DEBUG: u32 = 0x01;
/// Registers the built-in hidapi provider; implied when no transport
/// flag is given.
pub const FLAG_USE_HIDAPI: u32 = 0x02;
/// Accepted for compatibility; NFC devices come from an externally
/// registered provider.
pub const FLAG_USE_NFC: u32 = 0x04;
/// Accepted for compatibility; the platform authenticator proxy comes
/// from an externally registered provider.
pub const FLAG_USE_WINHELLO: u32 = 0x08;

/// Process-level initialisation: logging and the default device
/// provider. Idempotent; later calls are no-ops.
pub fn init(flags: u32) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if flags & FLAG_DEBUG != 0 || std::env::var_os("FIDO_DEBUG").is_some() {
            let _ = env_logger::Builder::from_env(
                env_logger::Env::new().filter_or("FIDO_DEBUG", "debug"),
            )
            .target(env_logger::Target::Stderr)
            .try_init();
        }

        let transports = flags & (FLAG_USE_HIDAPI | FLAG_USE_NFC | FLAG_USE_WINHELLO);
        if transports == 0 || flags & FLAG_USE_HIDAPI != 0 {
            transport::register_provider(Box::new(transport::HidapiProvider));
        }
        if flags & (FLAG_USE_NFC | FLAG_USE_WINHELLO) != 0 {
            log::debug!(
                "NFC and platform-proxy transports are external; register them with register_provider"
            );
        }

        log::info!("fido2-client {} initialised", env!("CARGO_PKG_VERSION"));
    });
}

/// Flushes the device-provider registry.
pub fn teardown() {
    transport::clear_providers();
}
