// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol: authenticated envelope framing and the RPC message
//! catalog exchanged between the controller and this agent.

pub mod envelope;
pub mod message;

pub use envelope::{
    decode, encode, read_envelope, write_envelope, AuthHeader, Envelope, EnvelopeFlags, WireError,
    MAX_MESSAGE_SIZE, MIN_SUPPORTED_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use message::{msg_type, AddressedRequest, AddressedResponse, Request, Response, RunningStep, StepCompleteEntry};
