use crate::error::{ErrorCode, IngressError};
use crate::ingress::IngressDispatcher;
use crate::model::TradeRecord;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

const MAX_HISTORY_LIMIT: usize = 1000;

fn status_for(error: &IngressError) -> HttpResponse {
    let code = error.code();
    let body = serde_json::json!({
        "success": false,
        "code": code,
        "detail": error.to_string(),
    });
    match error {
        IngressError::InvalidSignature(_) | IngressError::StaleTimestamp { .. } => {
            HttpResponse::Unauthorized().json(body)
        }
        IngressError::ReplayedSignal(_) => HttpResponse::Conflict().json(body),
        IngressError::Malformed(_) => HttpResponse::BadRequest().json(body),
        _ => HttpResponse::UnprocessableEntity().json(body),
    }
}

/// POST /webhook: the authenticated signal ingress. The MAC covers the exact
/// body bytes; the response is always bounded JSON.
pub async fn webhook(
    req: HttpRequest,
    body: web::Bytes,
    dispatcher: web::Data<Arc<IngressDispatcher>>,
) -> impl Responder {
    let signature = req
        .headers()
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let source = req.headers().get("x-source").and_then(|v| v.to_str().ok());

    match dispatcher.handle_signed(&body, signature, source).await {
        Ok(response) => {
            if response.success {
                HttpResponse::Accepted().json(response)
            } else if response.code == Some(ErrorCode::ReplayedSignal) {
                HttpResponse::Conflict().json(response)
            } else {
                HttpResponse::UnprocessableEntity().json(response)
            }
        }
        Err(e) => {
            warn!("Webhook rejected: {}", e);
            status_for(&e)
        }
    }
}

pub async fn health(dispatcher: web::Data<Arc<IngressDispatcher>>) -> impl Responder {
    HttpResponse::Ok().json(dispatcher.health())
}

pub async fn get_positions(dispatcher: web::Data<Arc<IngressDispatcher>>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "positions": dispatcher.shadow.all_positions(),
    }))
}

/// POST /positions/{symbol}/close: explicit close path (the one ABORT points
/// operators to after a fill).
pub async fn close_position(
    path: web::Path<String>,
    dispatcher: web::Data<Arc<IngressDispatcher>>,
) -> impl Responder {
    let symbol = path.into_inner();
    if !dispatcher.shadow.has_position(&symbol) {
        return HttpResponse::NotFound().json(serde_json::json!({
            "success": false,
            "detail": format!("no open position in {}", symbol),
        }));
    }

    match dispatcher.gateway.close_position(&symbol).await {
        Ok(ack) => {
            let exit_price = ack
                .avg_price
                .or_else(|| dispatcher.cache.summary(&symbol).map(|s| s.mid_price()))
                .unwrap_or(Decimal::ZERO);
            let trade = dispatcher
                .shadow
                .close_position(&symbol, exit_price, "MANUAL");
            dispatcher.pyramid.remove(&symbol);
            HttpResponse::Ok().json(serde_json::json!({
                "success": true,
                "trade": trade,
            }))
        }
        Err(e) => HttpResponse::BadGateway().json(serde_json::json!({
            "success": false,
            "code": e.code(),
            "detail": e.to_string(),
        })),
    }
}

/// POST /flatten: emergency close-all; reports both broker-side and local
/// close counts.
pub async fn flatten(dispatcher: web::Data<Arc<IngressDispatcher>>) -> impl Responder {
    let broker_closed = match dispatcher.gateway.close_all_positions().await {
        Ok(count) => count,
        Err(e) => {
            return HttpResponse::BadGateway().json(serde_json::json!({
                "success": false,
                "code": e.code(),
                "detail": e.to_string(),
            }))
        }
    };

    let mut local_closed = 0;
    for position in dispatcher.shadow.all_positions() {
        let exit_price = dispatcher
            .cache
            .summary(&position.symbol)
            .map(|s| s.mid_price())
            .unwrap_or(position.avg_entry_price);
        if dispatcher
            .shadow
            .close_position(&position.symbol, exit_price, "EMERGENCY_FLATTEN")
            .is_some()
        {
            dispatcher.pyramid.remove(&position.symbol);
            local_closed += 1;
        }
    }

    HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "broker_closed": broker_closed,
        "local_closed": local_closed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub symbol: Option<String>,
    pub phase: Option<u8>,
    pub regime_state: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

fn filter_history(trades: Vec<TradeRecord>, query: &HistoryQuery) -> (usize, Vec<TradeRecord>) {
    let filtered: Vec<TradeRecord> = trades
        .into_iter()
        .filter(|t| query.symbol.as_ref().map_or(true, |s| &t.symbol == s))
        .filter(|t| query.phase.map_or(true, |p| t.phase == p))
        .filter(|t| query.regime_state.map_or(true, |r| t.regime_state == r))
        .filter(|t| query.start_date.map_or(true, |d| t.closed_at >= d))
        .filter(|t| query.end_date.map_or(true, |d| t.closed_at <= d))
        .collect();

    let total = filtered.len();
    let limit = query.limit.unwrap_or(100).min(MAX_HISTORY_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let page = filtered.into_iter().skip(offset).take(limit).collect();
    (total, page)
}

/// GET /history: paginated trade history with symbol/phase/regime/date filters.
pub async fn history(
    query: web::Query<HistoryQuery>,
    dispatcher: web::Data<Arc<IngressDispatcher>>,
) -> impl Responder {
    let (total, trades) = filter_history(dispatcher.shadow.trade_history(), &query);
    HttpResponse::Ok().json(serde_json::json!({
        "total": total,
        "count": trades.len(),
        "trades": trades,
    }))
}

/// GET /performance: totals, win-rate, average PnL and the by-regime split.
pub async fn performance(dispatcher: web::Data<Arc<IngressDispatcher>>) -> impl Responder {
    let trades = dispatcher.shadow.trade_history();
    HttpResponse::Ok().json(performance_summary(&trades))
}

fn performance_summary(trades: &[TradeRecord]) -> serde_json::Value {
    let total = trades.len();
    let wins = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
    let total_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
    let avg_pnl = if total == 0 {
        Decimal::ZERO
    } else {
        total_pnl / Decimal::from(total as i64)
    };
    let win_rate = if total == 0 {
        0.0
    } else {
        wins as f64 / total as f64
    };

    let mut by_regime: HashMap<i32, (usize, Decimal)> = HashMap::new();
    for trade in trades {
        let entry = by_regime.entry(trade.regime_state).or_insert((0, Decimal::ZERO));
        entry.0 += 1;
        entry.1 += trade.pnl;
    }
    let regimes: HashMap<String, serde_json::Value> = by_regime
        .into_iter()
        .map(|(regime, (count, pnl))| {
            (
                regime.to_string(),
                serde_json::json!({ "trades": count, "pnl": pnl }),
            )
        })
        .collect();

    serde_json::json!({
        "total_trades": total,
        "wins": wins,
        "win_rate": win_rate,
        "total_pnl": total_pnl,
        "average_pnl": avg_pnl,
        "by_regime": regimes,
    })
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/webhook").route(web::post().to(webhook)))
        .service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/positions").route(web::get().to(get_positions)))
        .service(
            web::resource("/positions/{symbol}/close").route(web::post().to(close_position)),
        )
        .service(web::resource("/flatten").route(web::post().to(flatten)))
        .service(web::resource("/history").route(web::get().to(history)))
        .service(web::resource("/performance").route(web::get().to(performance)));
}
