//! Terminal verbs, backed by the PTY session manager.

use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use gatehouse_core::{GatewayError, GatewayResult};
use gatehouse_term::{Caller, SpawnOptions};

use crate::dispatch::{Dispatcher, RequestCtx};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteParams {
    terminal_id: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResizeParams {
    terminal_id: String,
    cols: u16,
    rows: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseParams {
    terminal_id: String,
}

fn caller(ctx: &RequestCtx) -> Caller<'_> {
    let record = ctx.conn.record();
    Caller {
        conn_id: record.conn_id,
        tenant_id: record.tenant_id(),
        admin: record.is_admin(),
    }
}

fn parse_terminal_id(raw: &str) -> GatewayResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| GatewayError::invalid_request(format!("invalid terminalId: {raw:?}")))
}

pub(super) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register("terminal.spawn", |gateway, ctx| async move {
        let opts: SpawnOptions = ctx.params()?;
        let info = gateway.terminals.spawn(caller(&ctx), opts)?;
        Ok(serde_json::to_value(info).unwrap_or_default())
    });

    dispatcher.register("terminal.write", |gateway, ctx| async move {
        let params: WriteParams = ctx.params()?;
        let id = parse_terminal_id(&params.terminal_id)?;
        gateway.terminals.write(caller(&ctx), id, &params.data)?;
        Ok(json!({}))
    });

    dispatcher.register("terminal.resize", |gateway, ctx| async move {
        let params: ResizeParams = ctx.params()?;
        let id = parse_terminal_id(&params.terminal_id)?;
        gateway
            .terminals
            .resize(caller(&ctx), id, params.cols, params.rows)?;
        Ok(json!({}))
    });

    dispatcher.register("terminal.close", |gateway, ctx| async move {
        let params: CloseParams = ctx.params()?;
        let id = parse_terminal_id(&params.terminal_id)?;
        gateway.terminals.close(caller(&ctx), id)?;
        Ok(json!({}))
    });

    dispatcher.register("terminal.list", |gateway, ctx| async move {
        let sessions = gateway.terminals.list(caller(&ctx));
        Ok(json!({ "terminals": sessions }))
    });
}
