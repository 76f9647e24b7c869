use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use log::error;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Filter, Rejection, Reply};

use crate::config::Config;
use crate::friends::{FriendGraph, Relation, Response};
use crate::gateway::Gateway;
use crate::messages::ServerEvent;
use crate::models::{
    FriendRequest, FriendRequestView, PublicUser, RequestId, SearchResult, User, UserId,
};
use crate::store::InMemoryMessageStore;
use crate::users::{DirectoryError, UserDirectory};

const MAX_BODY_BYTES: u64 = 16 * 1024;
const MIN_SEARCH_LEN: usize = 2;

/// Everything the HTTP and WebSocket handlers share.
#[derive(Clone)]
pub struct App {
    pub gateway: Gateway,
    users: Arc<RwLock<UserDirectory>>,
    friends: Arc<RwLock<FriendGraph>>,
}

impl App {
    pub fn new(config: &Config) -> Self {
        let store = Arc::new(InMemoryMessageStore::new(config.history_limit));
        App {
            gateway: Gateway::new(store, config.call_ring_timeout),
            users: Arc::new(RwLock::new(UserDirectory::new())),
            friends: Arc::new(RwLock::new(FriendGraph::new())),
        }
    }

    async fn public(&self, user: &User) -> PublicUser {
        PublicUser::new(user, self.gateway.is_online(&user.id).await)
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl Reject for ApiError {}

impl From<DirectoryError> for ApiError {
    fn from(err: DirectoryError) -> Self {
        let status = match err {
            DirectoryError::MissingField(_)
            | DirectoryError::SelfRequest
            | DirectoryError::InvalidAction(_) => StatusCode::BAD_REQUEST,
            DirectoryError::InvalidCredentials | DirectoryError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            DirectoryError::UnknownUser | DirectoryError::RequestNotFound => StatusCode::NOT_FOUND,
            DirectoryError::EmailTaken
            | DirectoryError::AlreadyFriends
            | DirectoryError::RequestPending
            | DirectoryError::RequestAnswered => StatusCode::CONFLICT,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

fn reject(err: DirectoryError) -> Rejection {
    warp::reject::custom(ApiError::from(err))
}

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Serialize)]
struct AuthResponse {
    token: String,
    user: User,
}

#[derive(Deserialize)]
struct AvatarRequest {
    avatar: String,
}

#[derive(Deserialize)]
struct FriendRequestBody {
    from: UserId,
    to: UserId,
}

#[derive(Deserialize)]
struct RespondBody {
    action: String,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    #[serde(rename = "userId")]
    user_id: Option<UserId>,
}

fn with_app(app: App) -> impl Filter<Extract = (App,), Error = Infallible> + Clone {
    warp::any().map(move || app.clone())
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: for<'de> Deserialize<'de> + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

/// The complete HTTP surface: JSON API, WebSocket upgrade, static files.
pub fn routes(
    app: App,
    static_dir: PathBuf,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let ws = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_app(app.clone()))
        .map(|ws: warp::ws::Ws, app: App| {
            ws.on_upgrade(move |socket| async move {
                app.gateway.handle_connection(socket).await;
            })
        });

    let register = warp::path!("api" / "register")
        .and(warp::post())
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(register);
    let login = warp::path!("api" / "login")
        .and(warp::post())
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(login);
    let me = warp::path!("api" / "me")
        .and(warp::get())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_app(app.clone()))
        .and_then(me);
    let users = warp::path!("api" / "users")
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(list_users);
    let avatar = warp::path!("api" / "users" / String / "avatar")
        .and(warp::put())
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(update_avatar);
    let messages = warp::path!("api" / "messages" / String / String)
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(history);
    let friends = warp::path!("api" / "friends" / String)
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(list_friends);
    let requests = warp::path!("api" / "friend-requests" / String)
        .and(warp::get())
        .and(with_app(app.clone()))
        .and_then(list_friend_requests);
    let send_request = warp::path!("api" / "friend-request")
        .and(warp::post())
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(send_friend_request);
    let respond = warp::path!("api" / "friend-request" / RequestId / "respond")
        .and(warp::post())
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(respond_to_friend_request);
    let search = warp::path!("api" / "search" / "users")
        .and(warp::get())
        .and(warp::query::<SearchQuery>())
        .and(with_app(app.clone()))
        .and_then(search_users);
    let health = warp::path!("health")
        .and(warp::get())
        .and(with_app(app))
        .and_then(health);

    let api = register
        .or(login)
        .or(me)
        .or(users)
        .or(avatar)
        .or(messages)
        .or(friends)
        .or(requests)
        .or(send_request)
        .or(respond)
        .or(search)
        .or(health);

    ws.or(api)
        .or(warp::fs::dir(static_dir))
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "PUT"])
                .allow_headers(vec!["content-type", "authorization"]),
        )
        .recover(handle_rejection)
        .with(warp::log("peer_relay::http"))
}

async fn register(body: RegisterRequest, app: App) -> Result<impl Reply, Rejection> {
    let (token, user) = app
        .users
        .write()
        .await
        .register(&body.username, &body.email, &body.password)
        .map_err(reject)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&AuthResponse { token, user }),
        StatusCode::CREATED,
    ))
}

async fn login(body: LoginRequest, app: App) -> Result<impl Reply, Rejection> {
    let (token, user) = app
        .users
        .write()
        .await
        .login(&body.email, &body.password)
        .map_err(reject)?;
    Ok(warp::reply::json(&AuthResponse { token, user }))
}

async fn me(authorization: Option<String>, app: App) -> Result<impl Reply, Rejection> {
    let token = authorization
        .as_deref()
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| reject(DirectoryError::InvalidToken))?;
    let user = app
        .users
        .read()
        .await
        .authenticate(token.trim())
        .cloned()
        .map_err(reject)?;
    Ok(warp::reply::json(&app.public(&user).await))
}

async fn list_users(app: App) -> Result<impl Reply, Rejection> {
    let online = app.gateway.online_users().await;
    let roster: Vec<PublicUser> = app
        .users
        .read()
        .await
        .all()
        .into_iter()
        .map(|user| PublicUser::new(user, online.contains(&user.id)))
        .collect();
    Ok(warp::reply::json(&roster))
}

async fn update_avatar(id: String, body: AvatarRequest, app: App) -> Result<impl Reply, Rejection> {
    let user = app
        .users
        .write()
        .await
        .set_avatar(&UserId::new(id), &body.avatar)
        .map_err(reject)?;
    Ok(warp::reply::json(&app.public(&user).await))
}

async fn history(a: String, b: String, app: App) -> Result<impl Reply, Rejection> {
    let messages = app.gateway.history(&UserId::new(a), &UserId::new(b)).await;
    Ok(warp::reply::json(&messages))
}

async fn list_friends(id: String, app: App) -> Result<impl Reply, Rejection> {
    let ids = app.friends.read().await.friends_of(&UserId::new(id));
    let online = app.gateway.online_users().await;
    let directory = app.users.read().await;
    let friends: Vec<PublicUser> = ids
        .iter()
        .filter_map(|id| directory.get(id))
        .map(|user| PublicUser::new(user, online.contains(&user.id)))
        .collect();
    Ok(warp::reply::json(&friends))
}

async fn friend_request_view(app: &App, request: FriendRequest) -> Option<FriendRequestView> {
    let sender = app.users.read().await.get(&request.from).cloned()?;
    Some(FriendRequestView {
        sender: app.public(&sender).await,
        request,
    })
}

async fn list_friend_requests(id: String, app: App) -> Result<impl Reply, Rejection> {
    let pending = app.friends.read().await.incoming(&UserId::new(id));
    let mut views = Vec::with_capacity(pending.len());
    for request in pending {
        if let Some(view) = friend_request_view(&app, request).await {
            views.push(view);
        }
    }
    Ok(warp::reply::json(&views))
}

async fn send_friend_request(body: FriendRequestBody, app: App) -> Result<impl Reply, Rejection> {
    {
        let directory = app.users.read().await;
        if !directory.contains(&body.from) || !directory.contains(&body.to) {
            return Err(reject(DirectoryError::UnknownUser));
        }
    }

    let request = app
        .friends
        .write()
        .await
        .send(&body.from, &body.to)
        .map_err(reject)?;

    if let Some(view) = friend_request_view(&app, request.clone()).await {
        app.gateway
            .relay(&request.to, ServerEvent::FriendRequestReceived(view))
            .await;
    }

    Ok(warp::reply::with_status(
        warp::reply::json(&request),
        StatusCode::CREATED,
    ))
}

async fn respond_to_friend_request(
    id: RequestId,
    body: RespondBody,
    app: App,
) -> Result<impl Reply, Rejection> {
    let response: Response = body.action.parse().map_err(reject)?;
    let request = app
        .friends
        .write()
        .await
        .respond(id, response)
        .map_err(reject)?;

    if response == Response::Accept {
        app.gateway
            .relay(&request.from, ServerEvent::FriendRequestAccepted(request.clone()))
            .await;
    }
    Ok(warp::reply::json(&request))
}

async fn search_users(query: SearchQuery, app: App) -> Result<impl Reply, Rejection> {
    if query.q.trim().chars().count() < MIN_SEARCH_LEN {
        return Ok(warp::reply::json(&Vec::<SearchResult>::new()));
    }

    let hits: Vec<User> = app
        .users
        .read()
        .await
        .search(&query.q)
        .into_iter()
        .filter(|user| query.user_id.as_ref() != Some(&user.id))
        .cloned()
        .collect();

    let online = app.gateway.online_users().await;
    let friends = app.friends.read().await;
    let results: Vec<SearchResult> = hits
        .iter()
        .map(|user| {
            let relation = query
                .user_id
                .as_ref()
                .map_or_else(Relation::default, |me| friends.relation(me, &user.id));
            SearchResult {
                user: PublicUser::new(user, online.contains(&user.id)),
                is_friend: relation.is_friend,
                has_pending_request: relation.has_pending_request,
                request_sent_by_me: relation.request_sent_by_me,
            }
        })
        .collect();
    Ok(warp::reply::json(&results))
}

async fn health(app: App) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&json!({
        "status": "ok",
        "onlineUsers": app.gateway.online_count().await,
        "connections": app.gateway.connection_count().await,
    })))
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(e) = err.find::<ApiError>() {
        (e.status, e.message.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large".to_string())
    } else if let Some(e) = err.find::<warp::filters::cors::CorsForbidden>() {
        (StatusCode::FORBIDDEN, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        status,
    ))
}
