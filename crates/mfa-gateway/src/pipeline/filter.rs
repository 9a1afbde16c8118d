use super::PipelineStep;
use crate::context::{AuthenticationStatus, ExecutionContext};
use crate::error::GatewayError;
use async_trait::async_trait;
use radius_codec::Code;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Answers Status-Server and drops everything that is not an Access-Request
pub struct PacketTypeFilterStep {
    started: Instant,
}

impl PacketTypeFilterStep {
    pub fn new(started: Instant) -> Self {
        PacketTypeFilterStep { started }
    }
}

/// "Server up 3 days 04:05:06, ver.: 0.1.0"
fn uptime_message(uptime: Duration) -> String {
    let seconds = uptime.as_secs();
    format!(
        "Server up {} days {:02}:{:02}:{:02}, ver.: {}",
        seconds / 86_400,
        (seconds % 86_400) / 3_600,
        (seconds % 3_600) / 60,
        seconds % 60,
        env!("CARGO_PKG_VERSION")
    )
}

#[async_trait]
impl PipelineStep for PacketTypeFilterStep {
    fn name(&self) -> &'static str {
        "packet-type-filter"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        match ctx.request.code {
            Code::AccessRequest => Ok(()),
            Code::StatusServer => {
                debug!(client = %ctx.client_name(), "Status-Server request");
                ctx.authentication_state
                    .set_first_factor(AuthenticationStatus::Accept);
                ctx.authentication_state
                    .set_second_factor(AuthenticationStatus::Accept);
                ctx.response_information.reply_message = Some(uptime_message(self.started.elapsed()));
                ctx.terminate();
                Ok(())
            }
            other => {
                warn!(
                    client = %ctx.client_name(),
                    packet_type = ?other,
                    identifier = ctx.request.identifier,
                    "Unsupported packet type, dropping"
                );
                ctx.skip_response();
                Ok(())
            }
        }
    }
}
