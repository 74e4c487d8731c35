use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::ExchangeConfig;
use crate::domain::{Category, Execution, InstrumentRules, Order, Position, PositionSide};
use crate::exchanges::bybit::client::{ApiError, Client, ClientConfig, ClientError};
use crate::exchanges::utils::{
    format_order_side, format_order_type, parse_decimal, parse_millis, parse_optional_decimal,
    parse_order_side, parse_order_status, parse_order_type,
};
use crate::exchanges::{
    Exchange, ExchangeError, OrderAck, OrderRequest, Result, TradingStopRequest,
};

const EXCHANGE_NAME: &str = "bybit";

/// Page size for list endpoints.
const LIST_LIMIT: &str = "50";
const EXECUTION_LIMIT: &str = "100";

/// Upper bound on pages read for one listing. A listing that does not end
/// within it is an error rather than a partial result.
const MAX_PAGES: usize = 50;

/// Bybit v5 exchange implementation.
pub struct BybitExchange {
    client: Client,
    settle_coin: String,
    account_type: String,
}

impl BybitExchange {
    /// Creates a new BybitExchange from the exchange config.
    pub fn from_config(config: &ExchangeConfig) -> Result<Self> {
        let client = Client::new(ClientConfig::from_exchange_config(config))
            .map_err(|e| ExchangeError::Internal(format!("build http client: {}", e)))?;

        info!(testnet = config.testnet, category = %config.category, "bybit client ready");

        Ok(Self {
            client,
            settle_coin: config.settle_coin.clone(),
            account_type: config.account_type.clone(),
        })
    }

    fn list_scope(&self, category: Category) -> Vec<(&'static str, String)> {
        let mut params = vec![("category", category.to_string())];
        if category != Category::Spot {
            params.push(("settleCoin", self.settle_coin.clone()));
        }
        params
    }

    async fn list_all<T>(
        &self,
        endpoint: &str,
        params: Vec<(&'static str, String)>,
        context: &str,
    ) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        collect_pages(context, |cursor| {
            let mut params = params.clone();
            if let Some(cursor) = cursor {
                params.push(("cursor", cursor));
            }
            async move {
                self.client
                    .get::<ListResult<T>>(endpoint, &params)
                    .await
                    .map_err(|e| map_client_error(e, context))
            }
        })
        .await
    }
}

/// Follows `nextPageCursor` until the exchange reports no further page.
async fn collect_pages<T, F, Fut>(context: &str, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<ListResult<T>>>,
{
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    for page in 1..=MAX_PAGES {
        let resp = fetch(cursor.clone()).await?;
        items.extend(resp.list);

        let next = resp.next_page_cursor.filter(|c| !c.is_empty());
        match next {
            None => return Ok(items),
            Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                return Err(ExchangeError::Internal(format!(
                    "{}: cursor {:?} repeated on page {}",
                    context, next, page
                )));
            }
            Some(next) => {
                debug!(context, page, items = items.len(), "fetching next page");
                cursor = Some(next);
            }
        }
    }

    Err(ExchangeError::Internal(format!(
        "{}: more than {} pages",
        context, MAX_PAGES
    )))
}

#[async_trait]
impl Exchange for BybitExchange {
    fn name(&self) -> &str {
        EXCHANGE_NAME
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut body = json!({
            "category": request.category.to_string(),
            "symbol": request.symbol,
            "side": format_order_side(request.side),
            "orderType": format_order_type(request.order_type),
            "qty": request.quantity.to_string(),
            "orderLinkId": request.idempotency_key,
        });
        if let Some(price) = request.price {
            body["price"] = json!(price.to_string());
        }
        if request.reduce_only {
            body["reduceOnly"] = json!(true);
        }

        let resp: PlaceOrderResult = self
            .client
            .post("/v5/order/create", &body)
            .await
            .map_err(|e| map_client_error(e, &request.idempotency_key))?;

        debug!(order_id = %resp.order_id, link_id = %resp.order_link_id, "order accepted");

        Ok(OrderAck {
            order_id: resp.order_id,
            idempotency_key: resp.order_link_id,
        })
    }

    async fn cancel_order(&self, category: Category, symbol: &str, order_id: &str) -> Result<()> {
        let body = json!({
            "category": category.to_string(),
            "symbol": symbol,
            "orderId": order_id,
        });
        let _: serde_json::Value = self
            .client
            .post("/v5/order/cancel", &body)
            .await
            .map_err(|e| map_client_error(e, order_id))?;
        Ok(())
    }

    async fn cancel_all_orders(&self, category: Category, symbol: Option<&str>) -> Result<usize> {
        let mut body = json!({ "category": category.to_string() });
        match symbol {
            Some(s) => body["symbol"] = json!(s),
            None if category != Category::Spot => body["settleCoin"] = json!(self.settle_coin),
            None => {}
        }

        let resp: ListResult<CancelledOrder> = self
            .client
            .post("/v5/order/cancel-all", &body)
            .await
            .map_err(|e| map_client_error(e, symbol.unwrap_or("*")))?;

        Ok(resp.list.len())
    }

    async fn open_orders(&self, category: Category) -> Result<Vec<Order>> {
        let mut params = self.list_scope(category);
        params.push(("openOnly", "0".to_string()));
        params.push(("limit", LIST_LIMIT.to_string()));

        let list: Vec<OrderInfo> = self.list_all("/v5/order/realtime", params, "open orders").await?;

        let mut orders = Vec::with_capacity(list.len());
        for info in list {
            let order = info.into_order(category)?;
            if order.status.is_active() {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    async fn order_by_key(
        &self,
        category: Category,
        symbol: &str,
        idempotency_key: &str,
    ) -> Result<Option<Order>> {
        let params = [
            ("category", category.to_string()),
            ("symbol", symbol.to_string()),
            ("orderLinkId", idempotency_key.to_string()),
        ];

        let resp: ListResult<OrderInfo> = self
            .client
            .get("/v5/order/realtime", &params)
            .await
            .map_err(|e| map_client_error(e, idempotency_key))?;

        resp.list
            .into_iter()
            .next()
            .map(|o| o.into_order(category))
            .transpose()
    }

    async fn positions(&self, category: Category) -> Result<Vec<Position>> {
        let mut params = self.list_scope(category);
        params.push(("limit", LIST_LIMIT.to_string()));

        let list: Vec<PositionInfo> = self.list_all("/v5/position/list", params, "positions").await?;

        let mut positions = Vec::with_capacity(list.len());
        for info in list {
            if let Some(position) = info.into_position()? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn executions(&self, category: Category, since: DateTime<Utc>) -> Result<Vec<Execution>> {
        let params = vec![
            ("category", category.to_string()),
            ("startTime", since.timestamp_millis().to_string()),
            ("limit", EXECUTION_LIMIT.to_string()),
        ];

        let list: Vec<ExecutionInfo> = self.list_all("/v5/execution/list", params, "executions").await?;
        list.into_iter().map(ExecutionInfo::into_execution).collect()
    }

    async fn set_trading_stop(&self, request: &TradingStopRequest) -> Result<()> {
        if request.category == Category::Spot {
            return Err(ExchangeError::Unsupported(
                "position trading stop is not available for spot".to_string(),
            ));
        }

        let mut body = json!({
            "category": request.category.to_string(),
            "symbol": request.symbol,
            "tpslMode": "Full",
            "positionIdx": 0,
        });
        if let Some(sl) = request.stop_loss {
            body["stopLoss"] = json!(sl.to_string());
        }
        if let Some(tp) = request.take_profit {
            body["takeProfit"] = json!(tp.to_string());
        }

        let _: serde_json::Value = self
            .client
            .post("/v5/position/trading-stop", &body)
            .await
            .map_err(|e| map_client_error(e, &request.symbol))?;
        Ok(())
    }

    async fn instrument_rules(&self, category: Category, symbol: &str) -> Result<InstrumentRules> {
        let params = [("category", category.to_string()), ("symbol", symbol.to_string())];

        let resp: ListResult<InstrumentInfo> = self
            .client
            .get("/v5/market/instruments-info", &params)
            .await
            .map_err(|e| map_client_error(e, symbol))?;

        let info = resp
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::InvalidParameter(format!("unknown symbol {}", symbol)))?;

        let lot = &info.lot_size_filter;
        let qty_step = match parse_optional_decimal(&lot.qty_step)? {
            Some(step) => step,
            None => parse_decimal(&lot.base_precision)?,
        };
        let min_notional = match parse_optional_decimal(&lot.min_notional_value)? {
            Some(min) => min,
            None => parse_decimal(&lot.min_order_amt)?,
        };

        Ok(InstrumentRules {
            tick_size: parse_decimal(&info.price_filter.tick_size)?,
            qty_step,
            min_order_qty: parse_decimal(&lot.min_order_qty)?,
            min_notional,
            symbol: info.symbol,
        })
    }

    async fn wallet_balance(&self) -> Result<Decimal> {
        let params = [("accountType", self.account_type.clone())];

        let resp: ListResult<WalletInfo> = self
            .client
            .get("/v5/account/wallet-balance", &params)
            .await
            .map_err(|e| map_client_error(e, "wallet balance"))?;

        let wallet = resp
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Internal("empty wallet response".to_string()))?;

        parse_decimal(&wallet.total_equity)
    }

    async fn last_price(&self, category: Category, symbol: &str) -> Result<Decimal> {
        let params = [("category", category.to_string()), ("symbol", symbol.to_string())];

        let resp: ListResult<TickerInfo> = self
            .client
            .get("/v5/market/tickers", &params)
            .await
            .map_err(|e| map_client_error(e, symbol))?;

        let ticker = resp.list.into_iter().next();
        let price = match ticker {
            Some(t) => parse_optional_decimal(&t.last_price)?,
            None => None,
        };
        price.ok_or_else(|| ExchangeError::InvalidParameter(format!("no ticker for {}", symbol)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
    #[serde(default)]
    next_page_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderResult {
    order_id: String,
    order_link_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledOrder {
    #[allow(dead_code)]
    order_id: String,
}

/// Order as returned by /v5/order/realtime.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderInfo {
    order_id: String,
    #[serde(default)]
    order_link_id: String,
    symbol: String,
    side: String,
    order_type: String,
    #[serde(default)]
    price: String,
    qty: String,
    #[serde(default)]
    cum_exec_qty: String,
    order_status: String,
    #[serde(default)]
    reduce_only: bool,
    created_time: String,
    updated_time: String,
}

impl OrderInfo {
    fn into_order(self, category: Category) -> Result<Order> {
        let side = parse_order_side(&self.side)
            .ok_or_else(|| ExchangeError::Internal(format!("order {}: bad side {:?}", self.order_id, self.side)))?;
        let order_type = parse_order_type(&self.order_type);

        Ok(Order {
            idempotency_key: Some(self.order_link_id).filter(|k| !k.is_empty()),
            category,
            symbol: self.symbol,
            side,
            order_type,
            price: parse_optional_decimal(&self.price)?,
            quantity: parse_decimal(&self.qty)?,
            filled_quantity: parse_decimal(&self.cum_exec_qty)?,
            status: parse_order_status(&self.order_status),
            reduce_only: self.reduce_only,
            created_at: parse_millis(&self.created_time),
            updated_at: parse_millis(&self.updated_time),
            order_id: self.order_id,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionInfo {
    symbol: String,
    side: String,
    size: String,
    avg_price: String,
    #[serde(default)]
    unrealised_pnl: String,
    #[serde(default)]
    updated_time: String,
}

impl PositionInfo {
    /// Flat positions come back with an empty side and zero size and map
    /// to `None`. A malformed open position is an error so that callers
    /// never mistake it for a closed one.
    fn into_position(self) -> Result<Option<Position>> {
        let quantity = parse_decimal(&self.size)
            .map_err(|e| ExchangeError::Internal(format!("position {} size: {}", self.symbol, e)))?;
        if quantity <= Decimal::ZERO {
            return Ok(None);
        }
        let side: PositionSide = parse_order_side(&self.side)
            .ok_or_else(|| {
                ExchangeError::Internal(format!("position {}: bad side {:?}", self.symbol, self.side))
            })?
            .into();

        Ok(Some(Position {
            side,
            quantity,
            entry_price: parse_decimal(&self.avg_price)?,
            unrealized_pnl: parse_decimal(&self.unrealised_pnl)?,
            updated_at: parse_millis(&self.updated_time),
            symbol: self.symbol,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionInfo {
    exec_id: String,
    order_id: String,
    symbol: String,
    side: String,
    exec_price: String,
    exec_qty: String,
    #[serde(default)]
    exec_fee: String,
    #[serde(default)]
    is_maker: bool,
    exec_time: String,
}

impl ExecutionInfo {
    fn into_execution(self) -> Result<Execution> {
        let side = parse_order_side(&self.side)
            .ok_or_else(|| ExchangeError::Internal(format!("execution {}: bad side", self.exec_id)))?;

        Ok(Execution {
            execution_id: self.exec_id,
            order_id: self.order_id,
            symbol: self.symbol,
            side,
            price: parse_decimal(&self.exec_price)?,
            quantity: parse_decimal(&self.exec_qty)?,
            fee: parse_decimal(&self.exec_fee)?,
            is_maker: self.is_maker,
            executed_at: parse_millis(&self.exec_time),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentInfo {
    symbol: String,
    price_filter: PriceFilter,
    lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceFilter {
    tick_size: String,
}

/// Linear contracts report qtyStep/minNotionalValue, spot basePrecision/minOrderAmt.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    #[serde(default)]
    qty_step: String,
    #[serde(default)]
    base_precision: String,
    min_order_qty: String,
    #[serde(default)]
    min_notional_value: String,
    #[serde(default)]
    min_order_amt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletInfo {
    total_equity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerInfo {
    #[serde(default)]
    last_price: String,
}

/// Maps Bybit client errors to exchange errors.
fn map_client_error(err: ClientError, context: &str) -> ExchangeError {
    match err {
        ClientError::Api(api_err) => map_api_error(api_err, context),
        ClientError::RateLimitExceeded { current, limit } => {
            ExchangeError::RateLimited(format!("{}: {}/{} per minute", context, current, limit))
        }
        ClientError::Request(e) if e.is_timeout() => {
            ExchangeError::Timeout(format!("{}: {}", context, e))
        }
        ClientError::Request(e) => ExchangeError::Connection(format!("{}: {}", context, e)),
        other => ExchangeError::Internal(format!("{}: {}", context, other)),
    }
}

fn map_api_error(err: ApiError, context: &str) -> ExchangeError {
    if let Some(status) = err.http_status {
        if status == 429 || status == 403 {
            return ExchangeError::RateLimited(format!("{}: http {}", context, status));
        }
        if status >= 500 {
            return ExchangeError::Server { code: err.code, message: err.message };
        }
    }

    let message = format!("{}: {}", context, err.message);
    match err.code {
        10006 | 10018 => ExchangeError::RateLimited(message),
        10000 | 10016 => ExchangeError::Server { code: err.code, message },
        10002 => ExchangeError::Timeout(message),
        110004 | 110007 | 110012 | 170131 => ExchangeError::InsufficientFunds(message),
        110001 | 110008 | 170213 => ExchangeError::OrderNotFound(context.to_string()),
        110072 => ExchangeError::DuplicateOrder(context.to_string()),
        10001 | 110003 | 110017 | 170136 => ExchangeError::InvalidParameter(message),
        code => ExchangeError::Rejected { code, message },
    }
}
