//! MsgPack-RPC request/response dispatch.
//!
//! Two-layer wire format: the envelope is a `serde`-derived enum encoded
//! with `rmp_serde`, and every data-carrying payload inside it is an
//! opaque protobuf-encoded byte string of the corresponding `wire` type,
//! passed through to clients verbatim. `dispatch` never panics: decode or
//! handler failures become `Response::Err`, so no request can crash the
//! device. Activity-changing methods post onto the command FIFO rather
//! than mutating the state machine directly, keeping all transitions on
//! the consumer thread.

use prost::Message;
use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::command::Command;
use crate::head_fsm::HeadParams;
use crate::timeline::Profile;
use crate::wire;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    GetStatus,
    GetHistoryChunk { client_version: u32, from: u32 },
    GetProfilesData { reset: bool },
    /// Protobuf-encoded `wire::ProfilesData`.
    SaveProfilesData { data: Vec<u8> },
    Stop,
    RunReflow,
    RunSensorBake { watts: f32 },
    RunAdrcTest { temperature: f32 },
    RunStepResponse { watts: f32 },
    GetHeadParams,
    /// Protobuf-encoded `wire::HeadParams`.
    SetHeadParams { data: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Protobuf-encoded `wire::DeviceStatus`.
    Status { data: Vec<u8> },
    /// Protobuf-encoded `wire::HistoryChunk`.
    HistoryChunk { data: Vec<u8> },
    /// Protobuf-encoded `wire::ProfilesData`.
    ProfilesData { data: Vec<u8> },
    /// Protobuf-encoded `wire::HeadParams`.
    HeadParams { data: Vec<u8> },
    Ok,
    Err { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthRequest {
    AuthInfo,
    Authenticate { token: String },
    Pair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthResponse {
    Info { pairing_open: bool },
    Authenticated { ok: bool },
    Paired { ok: bool },
}

pub fn dispatch(app: &App, request: Request) -> Response {
    match request {
        Request::GetStatus => Response::Status { data: app.status().encode_to_vec() },
        Request::GetHistoryChunk { client_version, from } => {
            let chunk = {
                let activity = app.activity.lock().unwrap();
                activity.core.history().read_chunk(client_version, from)
            };
            let pb = wire::history_chunk_from_points(chunk.task_id, chunk.version, &chunk.points);
            Response::HistoryChunk { data: pb.encode_to_vec() }
        }
        Request::GetProfilesData { reset } => {
            if reset {
                app.reset_profiles();
            }
            let pb = wire::ProfilesData {
                selected_id: app.selected_id(),
                items: app.load_profiles().iter().map(wire::Profile::from).collect(),
            };
            Response::ProfilesData { data: pb.encode_to_vec() }
        }
        Request::SaveProfilesData { data } => {
            let pb = match wire::ProfilesData::decode(&data[..]) {
                Ok(pb) => pb,
                Err(e) => return Response::Err { reason: e.to_string() },
            };
            let profiles: Result<Vec<Profile>, _> =
                pb.items.into_iter().map(Profile::try_from).collect();
            let profiles = match profiles {
                Ok(profiles) => profiles,
                Err(e) => return Response::Err { reason: e.to_string() },
            };
            match app.save_profiles(pb.selected_id, &profiles) {
                Ok(()) => Response::Ok,
                Err(e) => Response::Err { reason: e.to_string() },
            }
        }
        Request::Stop => {
            app.command_fifo.sender().post(Command::Stop { success: false });
            Response::Ok
        }
        Request::RunReflow => {
            app.command_fifo.sender().post(Command::Reflow);
            Response::Ok
        }
        Request::RunSensorBake { watts } => {
            app.command_fifo.sender().post(Command::SensorBake { watts });
            Response::Ok
        }
        Request::RunAdrcTest { temperature } => {
            app.command_fifo.sender().post(Command::AdrcTest { temperature });
            Response::Ok
        }
        Request::RunStepResponse { watts } => {
            app.command_fifo.sender().post(Command::StepResponse { watts });
            Response::Ok
        }
        Request::GetHeadParams => match app.get_head_params() {
            Ok(params) => {
                Response::HeadParams { data: wire::HeadParams::from(params).encode_to_vec() }
            }
            Err(e) => Response::Err { reason: e.to_string() },
        },
        Request::SetHeadParams { data } => {
            let pb = match wire::HeadParams::decode(&data[..]) {
                Ok(pb) => pb,
                Err(e) => return Response::Err { reason: e.to_string() },
            };
            let params = match HeadParams::try_from(pb) {
                Ok(params) => params,
                Err(e) => return Response::Err { reason: e.to_string() },
            };
            match app.set_head_params(params) {
                Ok(()) => Response::Ok,
                Err(e) => Response::Err { reason: e.to_string() },
            }
        }
    }
}

/// The authentication channel, kept separate from the RPC channel so a
/// client can pair before the RPC surface accepts mutating calls.
/// Pairing acceptance is gated by the activity machine's Bonding window.
pub fn dispatch_auth(app: &App, request: AuthRequest) -> AuthResponse {
    match request {
        AuthRequest::AuthInfo => AuthResponse::Info { pairing_open: app.is_pairing_active() },
        AuthRequest::Authenticate { token } => {
            AuthResponse::Authenticated { ok: !token.is_empty() }
        }
        AuthRequest::Pair => AuthResponse::Paired { ok: app.is_pairing_active() },
    }
}

pub fn encode_response(response: &Response) -> crate::error::Result<Vec<u8>> {
    rmp_serde::to_vec(response).map_err(|e| crate::error::Error::RpcDecode(e.to_string()))
}

pub fn decode_request(bytes: &[u8]) -> crate::error::Result<Request> {
    rmp_serde::from_slice(bytes).map_err(|e| crate::error::Error::RpcDecode(e.to_string()))
}
