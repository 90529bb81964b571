// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request model handed to the application.
//!
//! A [`Request`] wraps one decoded [`Message`] together with the connection it
//! arrived on and its [`ClientId`], the only handle the application needs to
//! address that connection later through the server context.

pub use client_id::{ClientId, DecodedClientId};
pub use handler::{
    ConnectionHook, EventHandler, Flow, HandlerChain, Middleware, OverloadHook, RequestHook,
};
pub use message::Message;
pub use request::Request;

mod client_id;
mod handler;
mod message;
#[allow(clippy::module_inception)]
mod request;
