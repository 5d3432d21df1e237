use crate::auth::{AdminUser, AuthUser};
use crate::errors::{ApiError, Result};
use crate::models::{
    AdminCreditBody, AdminPromoBody, CaptureBody, CreateAuthorizationBody, DeductBody,
    HistoryQuery, PurchaseBody, VoidBody,
};
use actix_web::{http::StatusCode, web, HttpRequest, HttpResponse};
use prometheus::Registry;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;
use wallet_core::{
    idempotency::Guarded,
    webhook::{WebhookHeaders, RAZORPAY_EVENT_ID_HEADER},
    Provider, RequestContext, UserId, Wallet,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";
pub const REPLAYED_HEADER: &str = "Idempotent-Replayed";

type WalletData = web::Data<Arc<Wallet>>;

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Per-request context from the caller identity and request headers
fn context(user: &AuthUser, req: &HttpRequest) -> RequestContext {
    let mut ctx = RequestContext::new(user.user_id.clone());
    if let Some(key) = header(req, IDEMPOTENCY_KEY_HEADER) {
        ctx = ctx.with_idempotency_key(key);
    }
    if let Some(id) = header(req, REQUEST_ID_HEADER).and_then(|v| Uuid::parse_str(&v).ok()) {
        ctx.request_id = id;
    }
    ctx
}

fn admin_context(admin: &AdminUser, req: &HttpRequest, user: String) -> RequestContext {
    context(&admin.0, req).acting_on(UserId::new(user))
}

/// Stored or fresh response of a guarded operation
fn guarded(result: Guarded) -> HttpResponse {
    let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::OK);
    let mut response = HttpResponse::build(status);
    if result.replayed {
        response.insert_header((REPLAYED_HEADER, "true"));
    }
    response.json(result.body)
}

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "wallet-api",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint(registry: web::Data<Registry>) -> Result<HttpResponse> {
    let body = wallet_core::metrics::render(&registry)
        .map_err(|e| ApiError::Internal(format!("metrics encoding failed: {}", e)))?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

// Wallet

pub async fn get_my_wallet(wallet: WalletData, user: AuthUser) -> Result<HttpResponse> {
    let view = wallet.balances(&user.user_id).await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn get_my_transactions(
    wallet: WalletData,
    user: AuthUser,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse> {
    query.validate()?;
    let page = wallet
        .history(&user.user_id, query.cursor.as_deref(), query.limit)
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn claim_registration_bonus(
    wallet: WalletData,
    user: AuthUser,
    req: HttpRequest,
) -> Result<HttpResponse> {
    let result = wallet.registration_bonus(&context(&user, &req)).await?;
    Ok(guarded(result))
}

// Authorizations

pub async fn create_authorization(
    wallet: WalletData,
    user: AuthUser,
    req: HttpRequest,
    body: web::Json<CreateAuthorizationBody>,
) -> Result<HttpResponse> {
    body.validate()?;
    let result = wallet
        .authorize(&context(&user, &req), body.into_inner().into())
        .await?;
    Ok(guarded(result))
}

pub async fn get_authorization(
    wallet: WalletData,
    user: AuthUser,
    req: HttpRequest,
    id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let authorization = wallet.authorization(&context(&user, &req), *id).await?;
    Ok(HttpResponse::Ok().json(authorization))
}

/// The body is optional; `{}` and an empty request are equivalent
pub async fn capture_authorization(
    wallet: WalletData,
    user: AuthUser,
    req: HttpRequest,
    id: web::Path<Uuid>,
    body: Option<web::Json<CaptureBody>>,
) -> Result<HttpResponse> {
    let body = body.map(web::Json::into_inner).unwrap_or_default();
    body.validate()?;
    let result = wallet
        .capture(&context(&user, &req), *id, body.into())
        .await?;
    Ok(guarded(result))
}

pub async fn void_authorization(
    wallet: WalletData,
    user: AuthUser,
    req: HttpRequest,
    id: web::Path<Uuid>,
    body: Option<web::Json<VoidBody>>,
) -> Result<HttpResponse> {
    let body = body.map(web::Json::into_inner).unwrap_or_default();
    body.validate()?;
    let result = wallet.void(&context(&user, &req), *id, body.into()).await?;
    Ok(guarded(result))
}

pub async fn deduct_tokens(
    wallet: WalletData,
    user: AuthUser,
    req: HttpRequest,
    body: web::Json<DeductBody>,
) -> Result<HttpResponse> {
    body.validate()?;
    let result = wallet
        .deduct(&context(&user, &req), body.into_inner().into())
        .await?;
    Ok(guarded(result))
}

// Purchases and receipts

pub async fn create_purchase(
    wallet: WalletData,
    user: AuthUser,
    req: HttpRequest,
    body: web::Json<PurchaseBody>,
) -> Result<HttpResponse> {
    body.validate()?;
    let result = wallet
        .create_purchase(&context(&user, &req), body.into_inner().into())
        .await?;
    Ok(guarded(result))
}

pub async fn get_purchase(
    wallet: WalletData,
    user: AuthUser,
    req: HttpRequest,
    id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let purchase = wallet.purchase(&context(&user, &req), *id).await?;
    Ok(HttpResponse::Ok().json(purchase))
}

pub async fn list_receipts(wallet: WalletData, user: AuthUser) -> Result<HttpResponse> {
    let receipts = wallet.receipts(&user.user_id).await?;
    Ok(HttpResponse::Ok().json(json!({ "items": receipts })))
}

pub async fn get_receipt(
    wallet: WalletData,
    user: AuthUser,
    req: HttpRequest,
    receipt_no: web::Path<String>,
) -> Result<HttpResponse> {
    let receipt = wallet.receipt(&context(&user, &req), &receipt_no).await?;
    Ok(HttpResponse::Ok().json(receipt))
}

/// Provider callback; authenticated by signature, not by bearer token
pub async fn payment_webhook(
    wallet: WalletData,
    provider: web::Path<String>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let provider: Provider = provider
        .parse()
        .map_err(|_| ApiError::NotFound(format!("unknown provider `{}`", provider)))?;
    let verifier = wallet.webhooks().verifier(provider)?;

    let headers = WebhookHeaders {
        signature: header(&req, verifier.signature_header()),
        event_id: header(&req, RAZORPAY_EVENT_ID_HEADER),
    };
    let result = wallet.handle_webhook(provider, &body, &headers).await?;
    Ok(HttpResponse::Ok().json(result))
}

// Admin

pub async fn admin_get_wallet(
    wallet: WalletData,
    _admin: AdminUser,
    user: web::Path<String>,
) -> Result<HttpResponse> {
    let view = wallet.balances(&UserId::new(user.into_inner())).await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn admin_get_transactions(
    wallet: WalletData,
    _admin: AdminUser,
    user: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse> {
    query.validate()?;
    let page = wallet
        .history(
            &UserId::new(user.into_inner()),
            query.cursor.as_deref(),
            query.limit,
        )
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn admin_verify_wallet(
    wallet: WalletData,
    _admin: AdminUser,
    user: web::Path<String>,
) -> Result<HttpResponse> {
    let check = wallet.verify(&UserId::new(user.into_inner())).await?;
    Ok(HttpResponse::Ok().json(check))
}

pub async fn admin_seed(
    wallet: WalletData,
    admin: AdminUser,
    req: HttpRequest,
    user: web::Path<String>,
    body: web::Json<AdminCreditBody>,
) -> Result<HttpResponse> {
    body.validate()?;
    let ctx = admin_context(&admin, &req, user.into_inner());
    let result = wallet.admin_seed(&ctx, body.into_inner().into()).await?;
    Ok(guarded(result))
}

pub async fn admin_refund(
    wallet: WalletData,
    admin: AdminUser,
    req: HttpRequest,
    user: web::Path<String>,
    body: web::Json<AdminCreditBody>,
) -> Result<HttpResponse> {
    body.validate()?;
    let ctx = admin_context(&admin, &req, user.into_inner());
    let result = wallet.admin_refund(&ctx, body.into_inner().into()).await?;
    Ok(guarded(result))
}

pub async fn admin_promo(
    wallet: WalletData,
    admin: AdminUser,
    req: HttpRequest,
    user: web::Path<String>,
    body: web::Json<AdminPromoBody>,
) -> Result<HttpResponse> {
    body.validate()?;
    let ctx = admin_context(&admin, &req, user.into_inner());
    let result = wallet.admin_promo(&ctx, body.into_inner().into()).await?;
    Ok(guarded(result))
}

pub async fn admin_get_purchase(
    wallet: WalletData,
    _admin: AdminUser,
    id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let purchase = wallet.purchase_admin(*id).await?;
    Ok(HttpResponse::Ok().json(purchase))
}

pub async fn admin_get_receipt(
    wallet: WalletData,
    _admin: AdminUser,
    receipt_no: web::Path<String>,
) -> Result<HttpResponse> {
    let receipt = wallet.receipt_admin(&receipt_no).await?;
    Ok(HttpResponse::Ok().json(receipt))
}

pub async fn admin_run_sweeps(wallet: WalletData, _admin: AdminUser) -> Result<HttpResponse> {
    let report = wallet.run_sweep().await?;
    Ok(HttpResponse::Ok().json(report))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/wallet/me")
            .route("", web::get().to(get_my_wallet))
            .route("/transactions", web::get().to(get_my_transactions))
            .route("/registration-bonus", web::post().to(claim_registration_bonus))
            .route("/purchases", web::post().to(create_purchase))
            .route("/purchases/{id}", web::get().to(get_purchase))
            .route("/receipts", web::get().to(list_receipts))
            .route("/receipts/{receipt_no}", web::get().to(get_receipt)),
    )
    .service(
        web::scope("/tokens")
            .route("/authorizations", web::post().to(create_authorization))
            .route("/authorizations/{id}", web::get().to(get_authorization))
            .route("/authorizations/{id}/capture", web::post().to(capture_authorization))
            .route("/authorizations/{id}/void", web::post().to(void_authorization))
            .route("/deduct", web::post().to(deduct_tokens)),
    )
    .service(
        web::scope("/admin")
            .route("/wallets/{user}", web::get().to(admin_get_wallet))
            .route("/wallets/{user}/transactions", web::get().to(admin_get_transactions))
            .route("/wallets/{user}/verify", web::get().to(admin_verify_wallet))
            .route("/wallets/{user}/seed", web::post().to(admin_seed))
            .route("/wallets/{user}/promo", web::post().to(admin_promo))
            .route("/wallets/{user}/refund", web::post().to(admin_refund))
            .route("/purchases/{id}", web::get().to(admin_get_purchase))
            .route("/receipts/{receipt_no}", web::get().to(admin_get_receipt))
            .route("/sweeps/run", web::post().to(admin_run_sweeps)),
    )
    .route("/payments/webhook/{provider}", web::post().to(payment_webhook))
    .route("/metrics", web::get().to(metrics_endpoint))
    .route("/health", web::get().to(health_check));
}
