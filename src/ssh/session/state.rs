use eyre::{eyre, Result};
use russh::client;

use crate::{api::Device, ssh::connector, target::Target};

/// How the end user authenticated, and therefore how the gateway will
/// authenticate against the device. Passwords are never validated at the
/// gateway; they are carried to the device's own SSH daemon.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    PublicKey,
}

impl Credential {
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PublicKey => "public_key",
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => write!(f, "Password(<redacted>)"),
            Credential::PublicKey => write!(f, "PublicKey"),
        }
    }
}

#[derive(Default, strum_macros::AsRefStr)]
pub enum State {
    // Used when a variant's fields have been moved out and the next state is
    // pending.
    Unknown,
    #[default]
    Unauthenticated,
    Authenticated {
        target: Target,
        device: Device,
        credential: Credential,
    },
    Connected {
        target: Target,
        device: Device,
        backend: client::Handle<connector::ClientHandler>,
    },
}

impl State {
    pub fn authenticated(&mut self, target: Target, device: Device, credential: Credential) {
        *self = State::Authenticated {
            target,
            device,
            credential,
        };
    }

    /// Move out the authenticated fields to build the backend leg; the
    /// caller must follow up with [`State::connected`].
    pub fn take_authenticated(&mut self) -> Result<(Target, Device, Credential)> {
        match std::mem::replace(self, State::Unknown) {
            State::Authenticated {
                target,
                device,
                credential,
            } => Ok((target, device, credential)),
            other => {
                *self = other;

                Err(eyre!("unexpected state: {:?}", self.as_ref()))
            }
        }
    }

    pub fn connected(
        &mut self,
        target: Target,
        device: Device,
        backend: client::Handle<connector::ClientHandler>,
    ) {
        *self = State::Connected {
            target,
            device,
            backend,
        };
    }

    pub fn device(&self) -> Option<&Device> {
        match self {
            State::Authenticated { device, .. } | State::Connected { device, .. } => Some(device),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<&Target> {
        match self {
            State::Authenticated { target, .. } | State::Connected { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn backend(&self) -> Option<&client::Handle<connector::ClientHandler>> {
        match self {
            State::Connected { backend, .. } => Some(backend),
            _ => None,
        }
    }
}
