use std::sync::Arc;

use serde::Deserialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::admission::{Admission, EndpointClass, Identity, RateLimiter};
use crate::context::{Actor, RequestContext, Role};
use crate::engine::{Engine, EngineError, now_ms};
use crate::model::{Booking, BookingStatus, Ms, SlotInfo};

#[derive(Debug, Clone, Deserialize)]
pub struct ReserveRequest {
    pub slot_id: Ulid,
    pub requester_id: Ulid,
    #[serde(default)]
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub booking_id: Ulid,
    pub caller_id: Ulid,
    pub caller_role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmRequest {
    pub booking_id: Ulid,
    pub merchant_id: Ulid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteRequest {
    pub booking_id: Ulid,
    pub merchant_id: Ulid,
}

#[derive(Debug)]
pub enum ServiceError {
    RateLimited { retry_after_ms: Ms },
    Engine(EngineError),
}

impl ServiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::RateLimited { .. } => "rate_limited",
            ServiceError::Engine(e) => e.kind(),
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::RateLimited { retry_after_ms } => {
                write!(f, "too many requests, retry in {retry_after_ms}ms")
            }
            ServiceError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        ServiceError::Engine(e)
    }
}

/// Request-layer entry point: admission first, then the engine.
pub struct BookingService {
    engine: Arc<Engine>,
    limiter: Arc<RateLimiter>,
}

impl BookingService {
    pub fn new(engine: Arc<Engine>, limiter: Arc<RateLimiter>) -> Self {
        Self { engine, limiter }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn admit(&self, identity: Identity, class: EndpointClass) -> Result<(), ServiceError> {
        match self.limiter.check(identity, class) {
            Admission::Allowed { .. } => Ok(()),
            Admission::Denied { retry_after_ms } => Err(ServiceError::RateLimited { retry_after_ms }),
        }
    }

    pub async fn reserve(&self, req: ReserveRequest) -> Result<Booking, ServiceError> {
        self.admit(Identity::User(req.requester_id), EndpointClass::Standard)?;
        let ctx = RequestContext::new(Actor::user(req.requester_id));
        let booking = self
            .engine
            .reserve(&ctx, req.slot_id, req.requester_id, req.remark)
            .instrument(ctx.span("reserve"))
            .await?;
        Ok(booking)
    }

    pub async fn cancel(&self, req: CancelRequest) -> Result<Booking, ServiceError> {
        if req.caller_role == Role::System {
            return Err(EngineError::Forbidden("system role is reserved for sweeps").into());
        }
        self.admit(Identity::User(req.caller_id), EndpointClass::Standard)?;
        let ctx = RequestContext::new(Actor {
            id: req.caller_id,
            role: req.caller_role,
        });
        let booking = self
            .engine
            .cancel(&ctx, req.booking_id)
            .instrument(ctx.span("cancel"))
            .await?;
        Ok(booking)
    }

    pub async fn confirm(&self, req: ConfirmRequest) -> Result<Booking, ServiceError> {
        self.admit(Identity::User(req.merchant_id), EndpointClass::Standard)?;
        let ctx = RequestContext::new(Actor::merchant(req.merchant_id));
        let booking = self
            .engine
            .confirm(&ctx, req.booking_id)
            .instrument(ctx.span("confirm"))
            .await?;
        Ok(booking)
    }

    pub async fn complete(&self, req: CompleteRequest) -> Result<Booking, ServiceError> {
        self.admit(Identity::User(req.merchant_id), EndpointClass::Standard)?;
        let ctx = RequestContext::new(Actor::merchant(req.merchant_id));
        let booking = self
            .engine
            .complete(&ctx, req.booking_id)
            .instrument(ctx.span("complete"))
            .await?;
        Ok(booking)
    }

    /// Public slot browsing. Counted against whoever is asking, signed in or not.
    pub async fn available_slots(&self, caller: Identity, task_id: Ulid) -> Result<Vec<SlotInfo>, ServiceError> {
        self.admit(caller, EndpointClass::Public)?;
        Ok(self.engine.available_slots(&task_id, now_ms()).await?)
    }

    pub async fn my_bookings(
        &self,
        user_id: Ulid,
        status: Option<BookingStatus>,
    ) -> Result<Vec<Booking>, ServiceError> {
        self.admit(Identity::User(user_id), EndpointClass::Standard)?;
        Ok(self.engine.bookings_for_requester(&user_id, status).await)
    }
}
