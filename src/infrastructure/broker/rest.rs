//! Brokerage REST adapter.
//!
//! Every response arrives in the upstream's envelope: a `rt_cd` return code
//! with `output*` payload blocks, all numbers encoded as strings. A return
//! code of "0" is success; the specific code `EGW00123` means the access
//! token expired, which triggers exactly one forced token refresh and retry
//! of the failed call. Real and virtual accounts use different transaction
//! ids for the same endpoint.

use crate::domain::errors::BrokerError;
use crate::domain::ports::BrokerageService;
use crate::domain::types::{
    AccountFunds, AccountType, OrderFill, OrderSide, PositionSnapshot,
};
use crate::infrastructure::broker::token::TokenManager;
use crate::infrastructure::core::http::with_query;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Utc};
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

const EXPIRED_TOKEN_CODE: &str = "EGW00123";

pub struct BrokerRestClient {
    http: ClientWithMiddleware,
    base_url: String,
    app_key: String,
    app_secret: String,
    account_no: String,
    product_code: String,
    account_type: AccountType,
    exchange_code: String,
    tokens: Arc<TokenManager>,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    #[serde(default)]
    ovrs_pdno: String,
    #[serde(default)]
    ovrs_cblc_qty: String,
    #[serde(default)]
    pchs_avg_pric: String,
    #[serde(default)]
    now_pric2: String,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default)]
    output1: Vec<PositionRow>,
}

#[derive(Debug, Deserialize)]
struct FundsRow {
    #[serde(default)]
    frcr_dncl_amt_2: String,
    #[serde(default)]
    frcr_drwg_psbl_amt_1: String,
}

#[derive(Debug, Deserialize)]
struct FundsResponse {
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default)]
    output2: Vec<FundsRow>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
}

#[derive(Debug, Deserialize)]
struct FillRow {
    #[serde(default)]
    odno: String,
    #[serde(default)]
    pdno: String,
    #[serde(default)]
    sll_buy_dvsn_cd: String,
    #[serde(default)]
    ft_ccld_qty: String,
    #[serde(default)]
    ft_ccld_unpr3: String,
    #[serde(default)]
    ord_dt: String,
    #[serde(default)]
    ord_tmd: String,
}

#[derive(Debug, Deserialize)]
struct FillsResponse {
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default)]
    output: Vec<FillRow>,
}

impl BrokerRestClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: ClientWithMiddleware,
        base_url: String,
        app_key: String,
        app_secret: String,
        account_no: String,
        account_type: AccountType,
        exchange_code: String,
        tokens: Arc<TokenManager>,
    ) -> Self {
        // Account numbers are "<cano>-<product>"; the product code defaults
        // to "01" when the suffix is missing.
        let (cano, product_code) = match account_no.split_once('-') {
            Some((cano, product)) => (cano.to_string(), product.to_string()),
            None => (account_no.clone(), "01".to_string()),
        };

        Self {
            http,
            base_url,
            app_key,
            app_secret,
            account_no: cano,
            product_code,
            account_type,
            exchange_code,
            tokens,
        }
    }

    fn tr_id(&self, real: &str, virt: &str) -> String {
        match self.account_type {
            AccountType::Real => real.to_string(),
            AccountType::Virtual => virt.to_string(),
        }
    }

    /// Normalized `<cano>-<product>` account id, also the token cache key.
    pub fn account_id(&self) -> String {
        format!("{}-{}", self.account_no, self.product_code)
    }

    async fn get(
        &self,
        path: &str,
        tr_id: &str,
        params: &[(&str, &str)],
        token: &str,
    ) -> Result<reqwest::Response, BrokerError> {
        let url = with_query(&format!("{}{}", self.base_url, path), params);
        let response = self
            .http
            .get(url)
            .header("content-type", "application/json; charset=utf-8")
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("tr_id", tr_id)
            .header("custtype", "P")
            .send()
            .await?;
        Ok(response)
    }

    async fn post(
        &self,
        path: &str,
        tr_id: &str,
        body: &serde_json::Value,
        token: &str,
    ) -> Result<reqwest::Response, BrokerError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("content-type", "application/json; charset=utf-8")
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("tr_id", tr_id)
            .header("custtype", "P")
            .json(body)
            .send()
            .await?;
        Ok(response)
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BrokerError> {
        let status = response.status();
        let text = response.text().await.map_err(BrokerError::from)?;

        if !status.is_success() {
            // Expired tokens can surface as HTTP errors with the envelope
            // code in the body.
            if text.contains(EXPIRED_TOKEN_CODE) {
                return Err(BrokerError::AuthExpired);
            }
            return Err(BrokerError::unavailable(format!("HTTP {status}")));
        }

        serde_json::from_str(&text).map_err(|e| BrokerError::invalid(format!("decode: {e}")))
    }

    fn check_envelope(rt_cd: &str, msg_cd: &str, msg1: &str) -> Result<(), BrokerError> {
        if rt_cd == "0" {
            return Ok(());
        }
        if msg_cd == EXPIRED_TOKEN_CODE {
            return Err(BrokerError::AuthExpired);
        }
        Err(BrokerError::invalid(format!("rt_cd {rt_cd} ({msg_cd}): {msg1}")))
    }

    async fn positions_request(
        &self,
        force_refresh: bool,
    ) -> Result<Vec<PositionSnapshot>, BrokerError> {
        let token = self
            .tokens
            .get_token(&self.account_id(), force_refresh)
            .await?;

        let tr_id = self.tr_id("TTTS3012R", "VTTS3012R");
        let response = self
            .get(
                "/uapi/overseas-stock/v1/trading/inquire-balance",
                &tr_id,
                &[
                    ("CANO", self.account_no.as_str()),
                    ("ACNT_PRDT_CD", self.product_code.as_str()),
                    ("OVRS_EXCG_CD", self.exchange_code.as_str()),
                    ("TR_CRCY_CD", "USD"),
                    ("CTX_AREA_FK200", ""),
                    ("CTX_AREA_NK200", ""),
                ],
                &token.access_token,
            )
            .await?;

        let payload: PositionsResponse = Self::read_json(response).await?;
        Self::check_envelope(&payload.rt_cd, &payload.msg_cd, &payload.msg1)?;

        let fetched_at = Utc::now();
        let mut positions = Vec::new();
        for row in payload.output1 {
            let quantity = parse_decimal(&row.ovrs_cblc_qty, "ovrs_cblc_qty")?
                .to_u32()
                .ok_or_else(|| {
                    BrokerError::invalid(format!("bad quantity: {}", row.ovrs_cblc_qty))
                })?;
            if quantity == 0 {
                continue;
            }
            positions.push(PositionSnapshot::new(
                row.ovrs_pdno,
                quantity,
                parse_decimal(&row.pchs_avg_pric, "pchs_avg_pric")?,
                parse_decimal(&row.now_pric2, "now_pric2")?,
                fetched_at,
            ));
        }
        Ok(positions)
    }

    async fn funds_request(&self, force_refresh: bool) -> Result<AccountFunds, BrokerError> {
        let token = self
            .tokens
            .get_token(&self.account_id(), force_refresh)
            .await?;

        let tr_id = self.tr_id("CTRP6504R", "VTRP6504R");
        let response = self
            .get(
                "/uapi/overseas-stock/v1/trading/inquire-present-balance",
                &tr_id,
                &[
                    ("CANO", self.account_no.as_str()),
                    ("ACNT_PRDT_CD", self.product_code.as_str()),
                    ("WCRC_FRCR_DVSN_CD", "02"),
                    ("NATN_CD", "840"),
                    ("TR_MKET_CD", "00"),
                    ("INQR_DVSN_CD", "00"),
                ],
                &token.access_token,
            )
            .await?;

        let payload: FundsResponse = Self::read_json(response).await?;
        Self::check_envelope(&payload.rt_cd, &payload.msg_cd, &payload.msg1)?;

        let row = payload
            .output2
            .first()
            .ok_or_else(|| BrokerError::invalid("balance response has no currency rows"))?;

        Ok(AccountFunds {
            cash: parse_decimal(&row.frcr_dncl_amt_2, "frcr_dncl_amt_2")?,
            buying_power: parse_decimal(&row.frcr_drwg_psbl_amt_1, "frcr_drwg_psbl_amt_1")?,
        })
    }

    async fn order_request(
        &self,
        side: OrderSide,
        ticker: &str,
        quantity: u32,
        price: Decimal,
        force_refresh: bool,
    ) -> Result<(), BrokerError> {
        let token = self
            .tokens
            .get_token(&self.account_id(), force_refresh)
            .await?;

        let tr_id = match side {
            OrderSide::Buy => self.tr_id("TTTT1002U", "VTTT1002U"),
            OrderSide::Sell => self.tr_id("TTTT1001U", "VTTT1001U"),
        };

        let body = serde_json::json!({
            "CANO": self.account_no,
            "ACNT_PRDT_CD": self.product_code,
            "OVRS_EXCG_CD": self.exchange_code,
            "PDNO": ticker,
            "ORD_QTY": quantity.to_string(),
            "OVRS_ORD_UNPR": price.to_string(),
            "ORD_SVR_DVSN_CD": "0",
            "ORD_DVSN": "00",
        });

        let response = self
            .post(
                "/uapi/overseas-stock/v1/trading/order",
                &tr_id,
                &body,
                &token.access_token,
            )
            .await?;

        let payload: OrderResponse = Self::read_json(response).await?;
        if payload.rt_cd != "0" {
            if payload.msg_cd == EXPIRED_TOKEN_CODE {
                return Err(BrokerError::AuthExpired);
            }
            return Err(BrokerError::OrderRejected {
                reason: format!("{} ({})", payload.msg1, payload.msg_cd),
            });
        }

        info!("Broker: {} order accepted: {} x{}", side, ticker, quantity);
        Ok(())
    }

    async fn fills_request(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        force_refresh: bool,
    ) -> Result<Vec<OrderFill>, BrokerError> {
        let token = self
            .tokens
            .get_token(&self.account_id(), force_refresh)
            .await?;

        let tr_id = self.tr_id("TTTS3035R", "VTTS3035R");
        let start_str = start.format("%Y%m%d").to_string();
        let end_str = end.format("%Y%m%d").to_string();
        let response = self
            .get(
                "/uapi/overseas-stock/v1/trading/inquire-ccnl",
                &tr_id,
                &[
                    ("CANO", self.account_no.as_str()),
                    ("ACNT_PRDT_CD", self.product_code.as_str()),
                    ("PDNO", "%"),
                    ("ORD_STRT_DT", start_str.as_str()),
                    ("ORD_END_DT", end_str.as_str()),
                    ("SLL_BUY_DVSN", "00"),
                    ("CCLD_NCCS_DVSN", "00"),
                    ("OVRS_EXCG_CD", self.exchange_code.as_str()),
                    ("SORT_SQN", "DS"),
                    ("CTX_AREA_FK200", ""),
                    ("CTX_AREA_NK200", ""),
                ],
                &token.access_token,
            )
            .await?;

        let payload: FillsResponse = Self::read_json(response).await?;
        Self::check_envelope(&payload.rt_cd, &payload.msg_cd, &payload.msg1)?;

        let mut fills = Vec::new();
        for row in payload.output {
            let quantity = parse_decimal(&row.ft_ccld_qty, "ft_ccld_qty")?
                .to_u32()
                .unwrap_or(0);
            if quantity == 0 {
                // Unfilled or cancelled orders come back with zero quantity.
                continue;
            }

            let side = match row.sll_buy_dvsn_cd.as_str() {
                "01" => OrderSide::Sell,
                "02" => OrderSide::Buy,
                other => {
                    warn!("Broker: unknown fill side code {other}, skipping");
                    continue;
                }
            };

            let date = NaiveDate::parse_from_str(&row.ord_dt, "%Y%m%d")
                .map_err(|_| BrokerError::invalid(format!("bad fill date: {}", row.ord_dt)))?;
            let time = NaiveTime::parse_from_str(&row.ord_tmd, "%H%M%S")
                .unwrap_or(NaiveTime::MIN);

            fills.push(OrderFill {
                order_no: row.odno,
                ticker: row.pdno,
                side,
                quantity,
                price: parse_decimal(&row.ft_ccld_unpr3, "ft_ccld_unpr3")?,
                filled_at: date.and_time(time).and_utc(),
            });
        }
        Ok(fills)
    }
}

#[async_trait]
impl BrokerageService for BrokerRestClient {
    async fn fetch_balance(&self) -> Result<AccountFunds, BrokerError> {
        match self.funds_request(false).await {
            Err(BrokerError::AuthExpired) => {
                warn!("Broker: balance call hit an expired token, refreshing once");
                self.funds_request(true).await
            }
            result => result,
        }
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
        match self.positions_request(false).await {
            Err(BrokerError::AuthExpired) => {
                warn!("Broker: position call hit an expired token, refreshing once");
                self.positions_request(true).await
            }
            result => result,
        }
    }

    async fn place_buy(
        &self,
        ticker: &str,
        quantity: u32,
        price: Decimal,
    ) -> Result<(), BrokerError> {
        match self
            .order_request(OrderSide::Buy, ticker, quantity, price, false)
            .await
        {
            Err(BrokerError::AuthExpired) => {
                warn!("Broker: buy order hit an expired token, refreshing once");
                self.order_request(OrderSide::Buy, ticker, quantity, price, true)
                    .await
            }
            result => result,
        }
    }

    async fn place_sell(&self, ticker: &str, quantity: u32) -> Result<(), BrokerError> {
        // Sells go out as market orders; the upstream expects price "0".
        match self
            .order_request(OrderSide::Sell, ticker, quantity, Decimal::ZERO, false)
            .await
        {
            Err(BrokerError::AuthExpired) => {
                warn!("Broker: sell order hit an expired token, refreshing once");
                self.order_request(OrderSide::Sell, ticker, quantity, Decimal::ZERO, true)
                    .await
            }
            result => result,
        }
    }

    async fn fetch_fills(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<OrderFill>, BrokerError> {
        match self.fills_request(start, end, false).await {
            Err(BrokerError::AuthExpired) => {
                warn!("Broker: fill history hit an expired token, refreshing once");
                self.fills_request(start, end, true).await
            }
            result => result,
        }
    }
}

fn parse_decimal(value: &str, field: &str) -> Result<Decimal, BrokerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(trimmed)
        .map_err(|_| BrokerError::invalid(format!("bad decimal in {field}: {value}")))
}
