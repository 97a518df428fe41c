//! Request identity. Session establishment (registration, cookies, tokens)
//! lives in the identity gateway in front of this service; requests arrive
//! here with the authenticated user id in a trusted header.

use std::str::FromStr;

use app::user;
use okapi::openapi3::{Object, SecurityRequirement, SecurityScheme, SecuritySchemeData};
use rocket::{
    async_trait,
    http::Status,
    request::{FromRequest, Outcome},
    Request,
};
use rocket_okapi::{
    gen::OpenApiGenerator,
    request::{OpenApiFromRequest, RequestHeaderInput},
};
use thiserror::Error;
use uuid::Uuid;

use crate::state::RocketState;

const USER_HEADER: &str = "X-User-Id";

pub struct Session {
    user_id: user::Id,
}

impl Session {
    pub fn user_id(&self) -> user::Id {
        self.user_id
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown user")]
    UnknownUser,
    #[error("rate limit exceeded")]
    RateLimited,
}

#[async_trait]
impl<'r> FromRequest<'r> for Session {
    type Error = Error;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let user_id = match req
            .headers()
            .get_one(USER_HEADER)
            .and_then(|header| Uuid::from_str(header).ok())
        {
            Some(id) => user::Id(id),
            None => return Outcome::Error((Status::Forbidden, Error::UnknownUser)),
        };
        let state = req.rocket().state::<RocketState>().unwrap();
        if user::get(&state.db, user_id).await.is_none() {
            return Outcome::Error((Status::Forbidden, Error::UnknownUser));
        }
        if state.rate_limit.check(user_id) {
            log::info!("rate limiting user {:?}", user_id);
            return Outcome::Error((Status::TooManyRequests, Error::RateLimited));
        }
        Outcome::Success(Session { user_id })
    }
}

impl<'a> OpenApiFromRequest<'a> for Session {
    fn from_request_input(
        _gen: &mut OpenApiGenerator,
        _name: String,
        _required: bool,
    ) -> rocket_okapi::Result<RequestHeaderInput> {
        let security_scheme = SecurityScheme {
            description: Some(format!(
                "Authenticated user id, injected by the identity gateway: \"{}\".",
                USER_HEADER
            )),
            data: SecuritySchemeData::ApiKey {
                name: USER_HEADER.to_owned(),
                location: "header".to_owned(),
            },
            extensions: Object::default(),
        };
        let mut security_req = SecurityRequirement::new();
        security_req.insert(USER_HEADER.to_owned(), Vec::new());
        Ok(RequestHeaderInput::Security(
            USER_HEADER.to_owned(),
            security_scheme,
            security_req,
        ))
    }
}
