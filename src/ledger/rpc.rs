//! EVM JSON-RPC ledger.
//!
//! Reads go through `eth_getCode` / `eth_call`. State-changing calls are estimated
//! first (a revert there carries the reason; any other node error is a communication
//! failure), then sent with
//! `eth_sendTransaction` from a node-managed deployer account and polled until mined.

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolCall};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{DataStore, LedgerQuery, MarketFactory, TransactionResult};
use crate::error::LedgerError;
use crate::models::TokenTriple;

sol! {
    interface IMarketFactory {
        function createMarket(address indexToken, address longToken, address shortToken) external;
    }

    interface IDataStore {
        function getUint(bytes32 key) external view returns (uint256);
        function setUint(bytes32 key, uint256 value) external returns (uint256);
    }
}

/// Gas estimates are padded by this percentage before sending.
const GAS_HEADROOM_PCT: u64 = 20;

#[derive(Debug, Clone)]
pub struct RpcLedgerConfig {
    pub rpc_url: String,
    /// Account that signs state-changing calls; must be unlocked on the node.
    pub deployer: Address,
    pub market_factory: Address,
    pub data_store: Address,
    pub request_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    status: Option<String>,
    block_number: Option<String>,
    gas_used: Option<String>,
}

/// Failure of a single JSON-RPC request.
#[derive(Debug)]
enum RpcFailure {
    /// The request never produced a usable response.
    Transport(String),
    /// The node answered with an error object.
    Rejected(RpcErrorObject),
}

impl RpcFailure {
    fn into_communication(self, method: &str) -> LedgerError {
        match self {
            Self::Transport(reason) => LedgerError::communication(format!("{}: {}", method, reason)),
            Self::Rejected(err) => LedgerError::communication(format!(
                "{} rejected ({}): {}",
                method, err.code, err.message
            )),
        }
    }
}

pub struct RpcLedger {
    client: Client,
    config: RpcLedgerConfig,
    request_id: AtomicU64,
}

impl RpcLedger {
    pub fn new(config: RpcLedgerConfig) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LedgerError::communication(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            request_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &RpcLedgerConfig {
        &self.config
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>, RpcFailure> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(format!("RPC request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(RpcFailure::Transport(format!("HTTP {}", response.status())));
        }

        let response: JsonRpcResponse<T> = response
            .json()
            .await
            .map_err(|e| RpcFailure::Transport(format!("failed to parse RPC response: {}", e)))?;

        if let Some(err) = response.error {
            return Err(RpcFailure::Rejected(err));
        }

        Ok(response.result)
    }

    /// Request whose result must be present.
    async fn query<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        self.request(method, params)
            .await
            .map_err(|e| e.into_communication(method))?
            .ok_or_else(|| LedgerError::communication(format!("{}: no result in RPC response", method)))
    }

    async fn eth_call(&self, to: Address, calldata: Vec<u8>) -> Result<Vec<u8>, LedgerError> {
        let result: String = self
            .query(
                "eth_call",
                json!([{ "to": to, "data": Bytes::from(calldata) }, "latest"]),
            )
            .await?;

        hex::decode(result.trim_start_matches("0x"))
            .map_err(|e| LedgerError::communication(format!("eth_call: invalid hex result: {}", e)))
    }

    /// Estimate, send and wait for a state-changing call.
    async fn transact(&self, to: Address, calldata: Vec<u8>) -> Result<TransactionResult, LedgerError> {
        let data = Bytes::from(calldata);
        let tx = json!({ "from": self.config.deployer, "to": to, "data": data });

        let estimate: String = match self.request("eth_estimateGas", json!([tx])).await {
            Ok(Some(estimate)) => estimate,
            Ok(None) => {
                return Err(LedgerError::communication("eth_estimateGas: no result in RPC response"))
            }
            // Rate limits, unknown accounts and overloaded nodes also answer with an error object.
            Err(RpcFailure::Rejected(err)) if is_revert(&err) => {
                return Err(LedgerError::reverted(revert_reason(&err)))
            }
            Err(failure) => return Err(failure.into_communication("eth_estimateGas")),
        };
        let gas = parse_quantity(&estimate)
            .ok_or_else(|| LedgerError::communication(format!("invalid gas estimate: {}", estimate)))?;
        let gas = gas + gas * GAS_HEADROOM_PCT / 100;

        let tx = json!({
            "from": self.config.deployer,
            "to": to,
            "data": data,
            "gas": format!("0x{:x}", gas),
        });
        let tx_hash: B256 = match self.request("eth_sendTransaction", json!([tx])).await {
            Ok(Some(hash)) => hash,
            Ok(None) => {
                return Err(LedgerError::communication("eth_sendTransaction: no result in RPC response"))
            }
            Err(RpcFailure::Rejected(err)) if is_revert(&err) => {
                return Err(LedgerError::reverted(revert_reason(&err)))
            }
            Err(failure) => return Err(failure.into_communication("eth_sendTransaction")),
        };
        debug!(tx_hash = %tx_hash, to = %to, gas, "transaction sent");

        let receipt = self.wait_for_receipt(tx_hash).await?;
        if receipt.status.as_deref().and_then(parse_quantity) == Some(0) {
            return Err(LedgerError::reverted(format!("transaction {} reverted", tx_hash)));
        }

        let result = TransactionResult {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.as_deref().and_then(parse_quantity),
            gas_used: receipt.gas_used.as_deref().and_then(parse_quantity),
        };
        info!(
            tx_hash = %result.tx_hash,
            block = ?result.block_number,
            gas_used = ?result.gas_used,
            "transaction mined"
        );
        Ok(result)
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<RpcReceipt, LedgerError> {
        let started = Instant::now();
        loop {
            let receipt: Option<RpcReceipt> = self
                .request("eth_getTransactionReceipt", json!([tx_hash]))
                .await
                .map_err(|e| e.into_communication("eth_getTransactionReceipt"))?;

            if let Some(receipt) = receipt {
                return Ok(receipt);
            }
            if started.elapsed() >= self.config.confirmation_timeout {
                return Err(LedgerError::communication(format!(
                    "transaction {} not mined after {:?}",
                    tx_hash, self.config.confirmation_timeout
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait::async_trait]
impl LedgerQuery for RpcLedger {
    async fn code_exists_at(&self, address: Address) -> Result<bool, LedgerError> {
        let code: String = self.query("eth_getCode", json!([address, "latest"])).await?;
        Ok(!code.trim_start_matches("0x").is_empty())
    }
}

#[async_trait::async_trait]
impl MarketFactory for RpcLedger {
    async fn create_market(&self, triple: &TokenTriple) -> Result<TransactionResult, LedgerError> {
        let call = IMarketFactory::createMarketCall {
            indexToken: triple.index,
            longToken: triple.long,
            shortToken: triple.short,
        };
        self.transact(self.config.market_factory, call.abi_encode()).await
    }
}

#[async_trait::async_trait]
impl DataStore for RpcLedger {
    async fn read_uint(&self, key: B256) -> Result<Option<U256>, LedgerError> {
        let call = IDataStore::getUintCall { key };
        let bytes = self.eth_call(self.config.data_store, call.abi_encode()).await?;
        decode_stored_uint(&bytes)
    }

    async fn write_uint(&self, key: B256, value: U256) -> Result<TransactionResult, LedgerError> {
        let call = IDataStore::setUintCall { key, value };
        self.transact(self.config.data_store, call.abi_encode()).await
    }
}

/// The data store answers zero for keys that were never set.
fn decode_stored_uint(bytes: &[u8]) -> Result<Option<U256>, LedgerError> {
    if bytes.len() < 32 {
        return Err(LedgerError::communication(format!(
            "getUint: response too short: {} bytes",
            bytes.len()
        )));
    }
    let value = U256::from_be_slice(&bytes[..32]);
    Ok((!value.is_zero()).then_some(value))
}

fn parse_quantity(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

fn is_revert(err: &RpcErrorObject) -> bool {
    err.code == 3 || err.message.to_ascii_lowercase().contains("revert")
}

fn revert_reason(err: &RpcErrorObject) -> String {
    let decoded = err
        .data
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|data| hex::decode(data.trim_start_matches("0x")).ok())
        .and_then(|data| alloy_sol_types::decode_revert_reason(&data));

    decoded.unwrap_or_else(|| err.message.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    const TX_HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    /// Maps (method, params) to a JSON-RPC response body without `jsonrpc`/`id`.
    type Handler = Arc<dyn Fn(&str, &Value) -> Value + Send + Sync>;

    /// Minimal HTTP/1.1 JSON-RPC node on a loopback port. Returns its URL.
    async fn serve(handler: Handler) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut reader = BufReader::new(read);
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let mut content_length = 0usize;
                        loop {
                            line.clear();
                            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                                return;
                            }
                            let header = line.trim_end();
                            if header.is_empty() {
                                break;
                            }
                            if let Some((name, value)) = header.split_once(':') {
                                if name.eq_ignore_ascii_case("content-length") {
                                    content_length = value.trim().parse().unwrap_or(0);
                                }
                            }
                        }

                        let mut body = vec![0u8; content_length];
                        if reader.read_exact(&mut body).await.is_err() {
                            return;
                        }
                        let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                        let method = request["method"].as_str().unwrap_or_default().to_string();

                        let mut reply = handler(&method, &request["params"]);
                        reply["jsonrpc"] = json!("2.0");
                        reply["id"] = request["id"].clone();
                        let payload = reply.to_string();
                        let response = format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                            payload.len(),
                            payload
                        );
                        if write.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        format!("http://{}", addr)
    }

    fn ok(result: Value) -> Value {
        json!({ "result": result })
    }

    fn error_reply(code: i64, message: &str) -> Value {
        json!({ "error": { "code": code, "message": message } })
    }

    fn receipt(status: &str) -> Value {
        json!({
            "transactionHash": TX_HASH,
            "status": status,
            "blockNumber": "0x2a",
            "gasUsed": "0x5208",
        })
    }

    fn ledger_at(url: String, confirmation_timeout: Duration) -> RpcLedger {
        RpcLedger::new(RpcLedgerConfig {
            rpc_url: url,
            deployer: Address::repeat_byte(0xde),
            market_factory: Address::repeat_byte(0x0f),
            data_store: Address::repeat_byte(0x0d),
            request_timeout: Duration::from_secs(5),
            confirmation_timeout,
            poll_interval: Duration::from_millis(10),
        })
        .unwrap()
    }

    /// Node that estimates and accepts every transaction, then answers receipts with `receipt_reply`.
    async fn mining_node(receipt_reply: impl Fn() -> Value + Send + Sync + 'static) -> String {
        serve(Arc::new(move |method: &str, _params: &Value| match method {
            "eth_estimateGas" => ok(json!("0x5208")),
            "eth_sendTransaction" => ok(json!(TX_HASH)),
            "eth_getTransactionReceipt" => receipt_reply(),
            other => error_reply(-32601, &format!("method {} not found", other)),
        }))
        .await
    }

    fn rpc_error(code: i64, message: &str, data: Option<Value>) -> RpcErrorObject {
        RpcErrorObject {
            code,
            message: message.to_string(),
            data,
        }
    }

    #[test]
    fn test_get_uint_calldata() {
        let key = B256::repeat_byte(0xaa);
        let data = IDataStore::getUintCall { key }.abi_encode();

        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[4..], key.as_slice());
    }

    #[test]
    fn test_create_market_calldata_orders_tokens() {
        let call = IMarketFactory::createMarketCall {
            indexToken: Address::repeat_byte(1),
            longToken: Address::repeat_byte(2),
            shortToken: Address::repeat_byte(3),
        };
        let data = call.abi_encode();

        assert_eq!(data.len(), 4 + 3 * 32);
        assert_eq!(&data[4 + 12..4 + 32], Address::repeat_byte(1).as_slice());
        assert_eq!(&data[4 + 64 + 12..], Address::repeat_byte(3).as_slice());
    }

    #[test]
    fn test_decode_stored_uint() {
        let mut word = [0u8; 32];
        assert_eq!(decode_stored_uint(&word).unwrap(), None);

        word[31] = 0x58;
        word[30] = 0x1b;
        assert_eq!(decode_stored_uint(&word).unwrap(), Some(U256::from(7000u64)));

        assert!(decode_stored_uint(&word[..16]).unwrap_err().is_communication());
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x5208"), Some(21_000));
        assert_eq!(parse_quantity("0x0"), Some(0));
        assert_eq!(parse_quantity("zz"), None);
    }

    #[test]
    fn test_revert_reason_prefers_decoded_data() {
        // Error("market exists")
        let data = concat!(
            "0x08c379a0",
            "0000000000000000000000000000000000000000000000000000000000000020",
            "000000000000000000000000000000000000000000000000000000000000000d",
            "6d61726b65742065786973747300000000000000000000000000000000000000"
        );
        let err = rpc_error(3, "execution reverted", Some(Value::String(data.to_string())));
        assert!(is_revert(&err));
        assert!(revert_reason(&err).contains("market exists"));

        let err = rpc_error(-32000, "execution reverted: Unauthorized", None);
        assert!(is_revert(&err));
        assert_eq!(revert_reason(&err), "execution reverted: Unauthorized");

        assert!(!is_revert(&rpc_error(-32000, "nonce too low", None)));
    }

    #[tokio::test]
    async fn test_estimate_rate_limit_is_communication_error() {
        let url = serve(Arc::new(|_: &str, _: &Value| error_reply(-32005, "rate limit exceeded"))).await;
        let ledger = ledger_at(url, Duration::from_secs(1));

        let err = ledger.write_uint(B256::ZERO, U256::from(1u64)).await.unwrap_err();
        assert!(err.is_communication(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_estimate_revert_is_execution_reverted() {
        let url = serve(Arc::new(|method: &str, _: &Value| match method {
            "eth_estimateGas" => json!({
                "error": {
                    "code": 3,
                    "message": "execution reverted",
                    "data": concat!(
                        "0x08c379a0",
                        "0000000000000000000000000000000000000000000000000000000000000020",
                        "000000000000000000000000000000000000000000000000000000000000000d",
                        "6d61726b65742065786973747300000000000000000000000000000000000000"
                    ),
                }
            }),
            _ => error_reply(-32601, "unexpected call"),
        }))
        .await;
        let ledger = ledger_at(url, Duration::from_secs(1));

        let triple = TokenTriple::new(Address::repeat_byte(1), Address::repeat_byte(1), Address::repeat_byte(2));
        match ledger.create_market(&triple).await.unwrap_err() {
            LedgerError::ExecutionReverted(reason) => assert!(reason.contains("market exists"), "{}", reason),
            other => panic!("expected revert, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_waits_for_receipt() {
        let sent = Arc::new(Mutex::new(None::<Value>));
        let polls = Arc::new(AtomicUsize::new(0));
        let (sent_by_node, polls_by_node) = (sent.clone(), polls.clone());

        let url = serve(Arc::new(move |method: &str, params: &Value| match method {
            "eth_estimateGas" => ok(json!("0x5208")),
            "eth_sendTransaction" => {
                *sent_by_node.lock() = Some(params[0].clone());
                ok(json!(TX_HASH))
            }
            "eth_getTransactionReceipt" => {
                if polls_by_node.fetch_add(1, Ordering::SeqCst) == 0 {
                    ok(Value::Null)
                } else {
                    ok(receipt("0x1"))
                }
            }
            other => error_reply(-32601, &format!("method {} not found", other)),
        }))
        .await;
        let ledger = ledger_at(url, Duration::from_secs(5));

        let result = ledger.write_uint(B256::repeat_byte(0xaa), U256::from(7000u64)).await.unwrap();

        assert_eq!(result.tx_hash, B256::repeat_byte(0x11));
        assert_eq!(result.block_number, Some(42));
        assert_eq!(result.gas_used, Some(21_000));
        assert_eq!(polls.load(Ordering::SeqCst), 2);

        let tx = sent.lock().clone().unwrap();
        // 21000 plus 20% headroom
        assert_eq!(tx["gas"], "0x6270");
        assert_eq!(
            tx["to"].as_str().unwrap().to_lowercase(),
            Address::repeat_byte(0x0d).to_string().to_lowercase()
        );
    }

    #[tokio::test]
    async fn test_failed_receipt_is_execution_reverted() {
        let url = mining_node(|| ok(receipt("0x0"))).await;
        let ledger = ledger_at(url, Duration::from_secs(5));

        let err = ledger.write_uint(B256::ZERO, U256::from(1u64)).await.unwrap_err();
        assert!(matches!(err, LedgerError::ExecutionReverted(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_unmined_transaction_times_out_as_communication_error() {
        let url = mining_node(|| ok(Value::Null)).await;
        let ledger = ledger_at(url, Duration::from_millis(50));

        let err = ledger.write_uint(B256::ZERO, U256::from(1u64)).await.unwrap_err();
        assert!(err.is_communication(), "{:?}", err);
        assert!(err.to_string().contains("not mined"));
    }

    #[tokio::test]
    async fn test_code_exists_at() {
        let occupied = Address::repeat_byte(0x42);
        let url = serve(Arc::new(move |method: &str, params: &Value| match method {
            "eth_getCode" => {
                let queried = params[0].as_str().unwrap_or_default().to_lowercase();
                if queried == occupied.to_string().to_lowercase() {
                    ok(json!("0x6080604052"))
                } else {
                    ok(json!("0x"))
                }
            }
            _ => error_reply(-32601, "unexpected call"),
        }))
        .await;
        let ledger = ledger_at(url, Duration::from_secs(1));

        assert!(ledger.code_exists_at(occupied).await.unwrap());
        assert!(!ledger.code_exists_at(Address::repeat_byte(0x43)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unset_uint_reads_as_none() {
        let url = serve(Arc::new(|method: &str, _: &Value| match method {
            "eth_call" => ok(json!(format!("0x{}", "00".repeat(32)))),
            _ => error_reply(-32601, "unexpected call"),
        }))
        .await;
        let ledger = ledger_at(url, Duration::from_secs(1));

        assert_eq!(ledger.read_uint(B256::repeat_byte(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_communication_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let ledger = ledger_at(format!("http://{}", addr), Duration::from_secs(1));

        let err = ledger.code_exists_at(Address::ZERO).await.unwrap_err();
        assert!(err.is_communication(), "{:?}", err);
    }
}
