// Identity resolution for gateway connections.
//
// The identity provider is an external collaborator; this service is the
// relay's view of it: a token comes in with the connection attempt and
// resolves to a stable participant id (or is rejected before any room
// logic runs). Tokens are HS256 JWTs issued by the same secret.

use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    name: String,
    iat: i64,
    exp: i64,
}

/// The authenticated principal behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub participant_id: String,
    pub display_name: String,
}

#[derive(Clone)]
pub struct JwtIdentityService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_token(
        &self,
        participant_id: &str,
        display_name: &str,
    ) -> anyhow::Result<String> {
        self.issue_token_at(participant_id, display_name, current_unix_timestamp()?)
    }

    fn issue_token_at(
        &self,
        participant_id: &str,
        display_name: &str,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: participant_id.to_owned(),
            name: display_name.to_owned(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    /// Resolve a connection token to its participant identity.
    pub fn resolve_token(&self, token: &str) -> anyhow::Result<UserIdentity> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        if claims.sub.trim().is_empty() {
            return Err(anyhow!("access token subject is empty"));
        }

        Ok(UserIdentity { participant_id: claims.sub, display_name: claims.name })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
