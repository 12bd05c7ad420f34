use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::{Serialize, de::DeserializeOwned};
use validator::Validate;

use crate::{
    clock::Timestamp,
    dao::{
        gateway::PersistenceGateway,
        models::{
            ActivityEntity, IntervalEnd, LeadershipEntity, MemberEntity, PresenceEntity,
            SessionEntity, SessionPatch,
        },
        storage::StorageResult,
    },
    platform::{ChannelId, MemberId},
};

use super::{
    config::HttpGatewayConfig,
    error::{HttpDaoError, HttpResult},
};

/// REST-backed [`PersistenceGateway`] talking to one CRUD API deployment.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    name: Arc<str>,
    base_url: Arc<Url>,
    token: Option<Arc<str>>,
}

impl HttpGateway {
    /// Build a client for the configured API root.
    pub fn connect(config: HttpGatewayConfig) -> HttpResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| HttpDaoError::ClientBuilder { source })?;

        let base_url = Url::parse(config.base_url.trim_end_matches('/')).map_err(|_| {
            HttpDaoError::InvalidBaseUrl {
                url: config.base_url.clone(),
            }
        })?;
        if base_url.cannot_be_a_base() {
            return Err(HttpDaoError::InvalidBaseUrl {
                url: config.base_url,
            });
        }

        Ok(Self {
            client,
            name: Arc::from(config.name),
            base_url: Arc::new(base_url),
            token: config.token.map(Arc::from),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = (*self.base_url).clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(segments));
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json<T>(&self, method: Method, segments: &[&str], body: &T) -> HttpResult<()>
    where
        T: ?Sized + Serialize,
    {
        let path = segments.join("/");
        let response = self
            .request(method, segments)
            .json(body)
            .send()
            .await
            .map_err(|source| HttpDaoError::RequestSend {
                path: path.clone(),
                source,
            })?;

        check_status(path, response).await.map(|_| ())
    }

    async fn get_json<T>(&self, segments: &[&str]) -> HttpResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let path = segments.join("/");
        let response = self
            .request(Method::GET, segments)
            .send()
            .await
            .map_err(|source| HttpDaoError::RequestSend {
                path: path.clone(),
                source,
            })?;

        let response = match check_status(path.clone(), response).await {
            Ok(response) => response,
            Err(HttpDaoError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|source| HttpDaoError::DecodeResponse { path, source })
    }
}

async fn check_status(path: String, response: Response) -> HttpResult<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(HttpDaoError::NotFound { path }),
        status if status.is_client_error() => {
            let body = response.text().await.unwrap_or_default();
            Err(HttpDaoError::Rejected { path, status, body })
        }
        status => Err(HttpDaoError::RequestStatus { path, status }),
    }
}

impl PersistenceGateway for HttpGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn upsert_member(&self, member: MemberEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            member.validate()?;
            let id = member.id.to_string();
            store
                .send_json(Method::PUT, &["member", id.as_str()], &member)
                .await
                .map_err(Into::into)
        })
    }

    fn find_member(&self, id: MemberId) -> BoxFuture<'static, StorageResult<Option<MemberEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let id = id.to_string();
            store
                .get_json::<MemberEntity>(&["member", id.as_str()])
                .await
                .map_err(Into::into)
        })
    }

    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            session.validate()?;
            store
                .send_json(Method::POST, &["session"], &session)
                .await
                .map_err(Into::into)
        })
    }

    fn find_session(
        &self,
        channel: ChannelId,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let id = channel.to_string();
            store
                .get_json::<SessionEntity>(&["session", id.as_str()])
                .await
                .map_err(Into::into)
        })
    }

    fn update_session(&self, patch: SessionPatch) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            patch.validate()?;
            let id = patch.channel_id.to_string();
            store
                .send_json(Method::PATCH, &["session", id.as_str()], &patch)
                .await
                .map_err(Into::into)
        })
    }

    fn end_session(
        &self,
        channel: ChannelId,
        ended_at: Timestamp,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let id = channel.to_string();
            store
                .send_json(Method::PATCH, &["session", id.as_str()], &IntervalEnd { ended_at })
                .await
                .map_err(Into::into)
        })
    }

    fn open_leadership(&self, interval: LeadershipEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .send_json(Method::POST, &["leadership"], &interval)
                .await
                .map_err(Into::into)
        })
    }

    fn open_presence(&self, interval: PresenceEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .send_json(Method::POST, &["presence"], &interval)
                .await
                .map_err(Into::into)
        })
    }

    fn close_presence(
        &self,
        channel: ChannelId,
        member: MemberId,
        ended_at: Timestamp,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let (channel, member) = (channel.to_string(), member.to_string());
            store
                .send_json(
                    Method::PATCH,
                    &["presence", channel.as_str(), member.as_str()],
                    &IntervalEnd { ended_at },
                )
                .await
                .map_err(Into::into)
        })
    }

    fn open_activity(&self, interval: ActivityEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            interval.validate()?;
            store
                .send_json(Method::POST, &["activity"], &interval)
                .await
                .map_err(Into::into)
        })
    }

    fn close_activity(
        &self,
        member: MemberId,
        activity_id: String,
        ended_at: Timestamp,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let member = member.to_string();
            store
                .send_json(
                    Method::PATCH,
                    &["activity", member.as_str(), activity_id.as_str()],
                    &IntervalEnd { ended_at },
                )
                .await
                .map_err(Into::into)
        })
    }

    fn list_unclosed_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .get_json::<Vec<SessionEntity>>(&["session", "unclosed"])
                .await
                .map(Option::unwrap_or_default)
                .map_err(Into::into)
        })
    }

    fn unclosed_session_for_leader(
        &self,
        leader: MemberId,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let leader = leader.to_string();
            store
                .get_json::<SessionEntity>(&["session", "unclosed", leader.as_str()])
                .await
                .map_err(Into::into)
        })
    }

    fn list_open_presence(
        &self,
        channel: ChannelId,
    ) -> BoxFuture<'static, StorageResult<Vec<PresenceEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let channel = channel.to_string();
            store
                .get_json::<Vec<PresenceEntity>>(&["presence", channel.as_str(), "open"])
                .await
                .map(Option::unwrap_or_default)
                .map_err(Into::into)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let path = "health".to_string();
            let response = store
                .request(Method::GET, &["health"])
                .send()
                .await
                .map_err(|source| HttpDaoError::RequestSend {
                    path: path.clone(),
                    source,
                })?;
            check_status(path, response).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_built_from_escaped_segments() {
        let gateway =
            HttpGateway::connect(HttpGatewayConfig::new("primary", "http://localhost:8000/api/"))
                .unwrap();
        let url = gateway.url(&["activity", "42", "Rocket League"]);
        assert_eq!(
            url.as_str(),
            "http://localhost:8000/api/activity/42/Rocket%20League"
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        let err = HttpGateway::connect(HttpGatewayConfig::new("primary", "mailto:ops@example.org"))
            .err()
            .unwrap();
        assert!(matches!(err, HttpDaoError::InvalidBaseUrl { .. }));
    }
}
