// exchange/protocol.rs
// ====
// Worker ↔ façade wire protocol
// ====
// Every call crossing the worker boundary is an envelope carrying a
// request id; the worker answers with exactly one response envelope per
// request and any number of unsolicited pushes.
// ====

use serde::{Deserialize, Serialize};
use serde_json::Value;

use exchange_common::book::OrderBook;
use exchange_common::store::ChangeCommand;
use exchange_common::types::{
    Account, Candle, CancelRequest, OrderRequest, OrderUpdateRequest,
};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    #[serde(rename_all = "camelCase")]
    Start { request_id: u64 },
    #[serde(rename_all = "camelCase")]
    AddAccounts {
        request_id: u64,
        accounts: Vec<Account>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveAccount {
        request_id: u64,
        account_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PlaceOrders {
        request_id: u64,
        account_id: String,
        orders: Vec<OrderRequest>,
        #[serde(default)]
        priority: bool,
    },
    #[serde(rename_all = "camelCase")]
    UpdateOrders {
        request_id: u64,
        account_id: String,
        updates: Vec<OrderUpdateRequest>,
        #[serde(default)]
        priority: bool,
    },
    #[serde(rename_all = "camelCase")]
    CancelOrders {
        request_id: u64,
        account_id: String,
        cancels: Vec<CancelRequest>,
        #[serde(default)]
        priority: bool,
    },
    #[serde(rename_all = "camelCase")]
    FetchOhlcv {
        request_id: u64,
        symbol: String,
        timeframe: String,
        limit: u32,
    },
    #[serde(rename_all = "camelCase")]
    ListenOhlcv {
        request_id: u64,
        symbol: String,
        timeframe: String,
    },
    #[serde(rename_all = "camelCase")]
    UnlistenOhlcv {
        request_id: u64,
        symbol: String,
        timeframe: String,
    },
    #[serde(rename_all = "camelCase")]
    ListenOrderBook {
        request_id: u64,
        symbol: String,
    },
    #[serde(rename_all = "camelCase")]
    UnlistenOrderBook {
        request_id: u64,
        symbol: String,
    },
    #[serde(rename_all = "camelCase")]
    FetchPositionMetadata {
        request_id: u64,
        account_id: String,
        symbol: String,
    },
    #[serde(rename_all = "camelCase")]
    SetLeverage {
        request_id: u64,
        account_id: String,
        symbol: String,
        leverage: Decimal,
    },
    #[serde(rename_all = "camelCase")]
    Stop { request_id: u64 },
}

impl WorkerRequest {
    pub fn request_id(&self) -> u64 {
        match self {
            WorkerRequest::Start { request_id }
            | WorkerRequest::AddAccounts { request_id, .. }
            | WorkerRequest::RemoveAccount { request_id, .. }
            | WorkerRequest::PlaceOrders { request_id, .. }
            | WorkerRequest::UpdateOrders { request_id, .. }
            | WorkerRequest::CancelOrders { request_id, .. }
            | WorkerRequest::FetchOhlcv { request_id, .. }
            | WorkerRequest::ListenOhlcv { request_id, .. }
            | WorkerRequest::UnlistenOhlcv { request_id, .. }
            | WorkerRequest::ListenOrderBook { request_id, .. }
            | WorkerRequest::UnlistenOrderBook { request_id, .. }
            | WorkerRequest::FetchPositionMetadata { request_id, .. }
            | WorkerRequest::SetLeverage { request_id, .. }
            | WorkerRequest::Stop { request_id } => *request_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerEvent {
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Update { changes: Vec<ChangeCommand> },
    #[serde(rename_all = "camelCase")]
    Log { message: String },
    #[serde(rename_all = "camelCase")]
    Error { error: String },
    #[serde(rename_all = "camelCase")]
    Candle {
        symbol: String,
        timeframe: String,
        candle: Candle,
    },
    #[serde(rename_all = "camelCase")]
    OrderBook {
        symbol: String,
        order_book: OrderBook,
    },
}

impl WorkerEvent {
    pub fn ok<T: Serialize>(request_id: u64, data: T) -> Self {
        WorkerEvent::Response {
            request_id,
            data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
            error: None,
        }
    }

    pub fn err(request_id: u64, message: impl std::fmt::Display) -> Self {
        WorkerEvent::Response {
            request_id,
            data: None,
            error: Some(message.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_tags() {
        let request = WorkerRequest::Start { request_id: 3 };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "start");
        assert_eq!(value["requestId"], 3);

        let request = WorkerRequest::FetchPositionMetadata {
            request_id: 4,
            account_id: "a1".to_string(),
            symbol: "BTCUSDT".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "fetchPositionMetadata");
        assert_eq!(value["accountId"], "a1");
    }

    #[test]
    fn test_event_envelope_tags() {
        let event = WorkerEvent::ok(7, serde_json::json!(["id-1"]));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["requestId"], 7);
        assert!(value.get("error").is_none());

        let event = WorkerEvent::OrderBook {
            symbol: "BTCUSDT".to_string(),
            order_book: OrderBook::default(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "orderBook");
        assert!(value.get("orderBook").is_some());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let event = WorkerEvent::Update {
            changes: vec![ChangeCommand::update("bybit.public.latency", 12)],
        };
        let text = serde_json::to_string(&event).unwrap();
        let back: WorkerEvent = serde_json::from_str(&text).unwrap();
        match back {
            WorkerEvent::Update { changes } => assert_eq!(changes.len(), 1),
            other => panic!("unexpected envelope: {:?}", other),
        }
    }
}
