//! Synchronous opcode/payload/response exchange over the command endpoints.
//!
//! One bulk write carries the whole encoded command; one bulk read of up to
//! 512 bytes carries the whole response. There is no retry: a response
//! timing out is fatal to the caller.

use crate::proto::{self, CMD_RESPONSE_LEN, EP_CMD_IN, EP_CMD_OUT};
use nusb::transfer::RequestBuffer;
use nusb::Interface;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Default per-exchange deadline, matching the captured tooling.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(
        "response mismatch for opcode 0x{opcode:02X} at {step}: \
         expected {expected:02X?}, got {actual:02X?}"
    )]
    ProtocolMismatch {
        step: &'static str,
        opcode: u32,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
    #[error("opcode 0x{opcode:02X} timed out after {timeout:?}")]
    Timeout { opcode: u32, timeout: Duration },
    #[error("usb transfer failed for opcode 0x{opcode:02X}: {source}")]
    Transfer {
        opcode: u32,
        source: nusb::transfer::TransferError,
    },
}

/// Command channel over the paired bulk endpoints.
///
/// All calls are sequential by construction: every method takes `&mut self`
/// and completes the full write/read exchange before returning.
pub struct CommandChannel {
    interface: Interface,
    timeout: Duration,
}

impl CommandChannel {
    pub fn new(interface: Interface) -> Self {
        Self {
            interface,
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Execute one command and return the raw response bytes verbatim.
    pub async fn execute(&mut self, opcode: u32, payload: &[u8]) -> Result<Vec<u8>, CommandError> {
        let wire = proto::encode_command(opcode, payload);
        tracing::trace!(opcode, len = payload.len(), "command write");

        timeout(self.timeout, self.interface.bulk_out(EP_CMD_OUT, wire))
            .await
            .map_err(|_| CommandError::Timeout {
                opcode,
                timeout: self.timeout,
            })?
            .into_result()
            .map_err(|source| CommandError::Transfer { opcode, source })?;

        let response = timeout(
            self.timeout,
            self.interface
                .bulk_in(EP_CMD_IN, RequestBuffer::new(CMD_RESPONSE_LEN)),
        )
        .await
        .map_err(|_| CommandError::Timeout {
            opcode,
            timeout: self.timeout,
        })?
        .into_result()
        .map_err(|source| CommandError::Transfer { opcode, source })?;

        tracing::trace!(opcode, len = response.len(), "command response");
        Ok(response)
    }

    /// Execute and assert the response equals `expected` byte-for-byte.
    ///
    /// Used only for the scripted initialization handshake, where every
    /// step's response was captured from a known-good traffic recording.
    pub async fn validate(
        &mut self,
        step: &'static str,
        opcode: u32,
        payload: &[u8],
        expected: &[u8],
    ) -> Result<(), CommandError> {
        let actual = self.execute(opcode, payload).await?;
        if actual != expected {
            return Err(CommandError::ProtocolMismatch {
                step,
                opcode,
                expected: expected.to_vec(),
                actual,
            });
        }
        Ok(())
    }

    /// Write a command without soliciting a response.
    ///
    /// Only the abort-stream opcode behaves this way: the device emits an
    /// asynchronous ABORTED marker on the streaming endpoint instead.
    pub async fn send_only(&mut self, opcode: u32, payload: &[u8]) -> Result<(), CommandError> {
        let wire = proto::encode_command(opcode, payload);
        tracing::trace!(opcode, len = payload.len(), "command write (no response)");

        timeout(self.timeout, self.interface.bulk_out(EP_CMD_OUT, wire))
            .await
            .map_err(|_| CommandError::Timeout {
                opcode,
                timeout: self.timeout,
            })?
            .into_result()
            .map_err(|source| CommandError::Transfer { opcode, source })?;
        Ok(())
    }
}
