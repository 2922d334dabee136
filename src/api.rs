//! REST surface over [`CertificateAuthority`].
//!
//! The caller is identified by the `x-actor-id`, `x-actor-role` and
//! `x-actor-organization` headers set by the fronting gateway. Bodies are
//! camelCase JSON; `keyUsage` travels as nine booleans in RFC 5280 bit order.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info};
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::audit::AuditFilter;
use crate::authority::CertificateAuthority;
use crate::cert::extensions::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use crate::cert::params::{DistinguishedName, Validity};
use crate::error::CaError;
use crate::issuer::RequestedExtensions;
use crate::model::{
    Actor, CertificateId, CertificateRecord, CertificateSummary, CertificateType, RevocationReason,
    Role,
};
use crate::template::{CertificateTemplate, IssuanceRequest, TemplateId, TemplatePolicy};

const PEM_CONTENT_TYPE: &str = "application/x-pem-file";
const DER_CONTENT_TYPE: &str = "application/pkix-cert";
const CRL_CONTENT_TYPE: &str = "application/pkix-crl";

#[derive(Debug)]
struct ApiError(CaError);

impl warp::reject::Reject for ApiError {}

#[derive(Debug)]
struct MissingActor;

impl warp::reject::Reject for MissingActor {}

fn reject(err: CaError) -> Rejection {
    warp::reject::custom(ApiError(err))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub field: Option<String>,
}

/// Root and intermediate issuance.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaCertificateBody {
    #[serde(flatten)]
    pub subject: DistinguishedName,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_from: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_to: OffsetDateTime,
    #[serde(default)]
    pub key_usage: Option<Vec<bool>>,
    #[serde(default)]
    pub basic_constraints: Option<String>,
    #[serde(default)]
    pub extended_key_usage: Option<String>,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
    #[serde(default)]
    pub issuer_certificate_id: Option<CertificateId>,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndEntityBody {
    pub csr_pem: String,
    pub issuer_certificate_id: CertificateId,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_from: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_to: OffsetDateTime,
    #[serde(default)]
    pub key_usage: Option<Vec<bool>>,
    #[serde(default)]
    pub extended_key_usage: Option<String>,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedBody {
    pub certificate: CertificateSummary,
    pub serial_number: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidBody {
    pub valid: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateBody {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub ca_issuer_id: CertificateId,
    pub common_name_regex: String,
    #[serde(default)]
    pub sans_regex: Option<String>,
    pub max_validity_days: u32,
    #[serde(default)]
    pub key_usage: Option<Vec<bool>>,
    #[serde(default)]
    pub extended_key_usage: Option<String>,
    #[serde(default)]
    pub basic_constraints: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateView {
    pub id: TemplateId,
    pub name: String,
    pub description: Option<String>,
    pub ca_issuer_id: CertificateId,
    pub common_name_regex: String,
    pub sans_regex: Option<String>,
    pub max_validity_days: u32,
    pub key_usage: Vec<bool>,
    pub extended_key_usage: String,
    pub basic_constraints: String,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UseTemplateBody {
    #[serde(flatten)]
    pub subject: DistinguishedName,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
}

/// Prefilled issuance payload returned by `POST /templates/{id}/use`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceRequestView {
    pub template_id: Option<TemplateId>,
    pub issuer_certificate_id: CertificateId,
    #[serde(rename = "type")]
    pub certificate_type: CertificateType,
    pub subject: DistinguishedName,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_to: OffsetDateTime,
    pub key_usage: Vec<bool>,
    pub extended_key_usage: String,
    pub basic_constraints: String,
    pub subject_alt_names: Vec<String>,
}

impl From<CertificateTemplate> for TemplateView {
    fn from(t: CertificateTemplate) -> Self {
        Self {
            id: t.id,
            name: t.name,
            description: t.description,
            ca_issuer_id: t.ca_issuer_id,
            common_name_regex: t.common_name_regex,
            sans_regex: t.sans_regex,
            max_validity_days: t.max_validity_days,
            key_usage: t.key_usage.to_bits_vec(),
            extended_key_usage: t.extended_key_usage.to_string(),
            basic_constraints: t.basic_constraints.to_string(),
            created_by: t.created_by,
            created_at: t.created_at,
        }
    }
}

impl From<IssuanceRequest> for IssuanceRequestView {
    fn from(r: IssuanceRequest) -> Self {
        Self {
            template_id: r.template_id,
            issuer_certificate_id: r.issuer_id,
            certificate_type: r.certificate_type,
            subject: r.subject,
            valid_from: r.validity.not_before,
            valid_to: r.validity.not_after,
            key_usage: r.key_usage.to_bits_vec(),
            extended_key_usage: r.extended_key_usage.to_string(),
            basic_constraints: r.basic_constraints.to_string(),
            subject_alt_names: r.subject_alt_names,
        }
    }
}

impl TemplateBody {
    fn into_policy(self) -> crate::error::Result<TemplatePolicy> {
        Ok(TemplatePolicy {
            name: self.name,
            description: self.description,
            ca_issuer_id: self.ca_issuer_id,
            common_name_regex: self.common_name_regex,
            sans_regex: self.sans_regex,
            max_validity_days: self.max_validity_days,
            key_usage: parse_key_usage(self.key_usage)?,
            extended_key_usage: parse_extended_key_usage(self.extended_key_usage)?,
            basic_constraints: match self.basic_constraints {
                Some(text) => text.parse()?,
                None => BasicConstraints::end_entity(),
            },
        })
    }
}

fn parse_key_usage(bits: Option<Vec<bool>>) -> crate::error::Result<KeyUsage> {
    bits.map_or(Ok(KeyUsage::default()), |bits| KeyUsage::from_bits_vec(&bits))
}

fn parse_extended_key_usage(text: Option<String>) -> crate::error::Result<ExtendedKeyUsage> {
    match text {
        Some(text) if !text.trim().is_empty() => text.parse(),
        _ => Ok(ExtendedKeyUsage::default()),
    }
}

fn validity(valid_from: Option<OffsetDateTime>, valid_to: OffsetDateTime) -> Validity {
    let not_before = valid_from.unwrap_or_else(OffsetDateTime::now_utc);
    Validity {
        not_before: not_before.replace_nanosecond(0).unwrap_or(not_before),
        not_after: valid_to.replace_nanosecond(0).unwrap_or(valid_to),
    }
}

fn issued(record: CertificateRecord) -> Response {
    let body = IssuedBody {
        serial_number: record.serial_number.clone(),
        certificate: record.summary(OffsetDateTime::now_utc()),
    };
    warp::reply::with_status(warp::reply::json(&body), StatusCode::CREATED).into_response()
}

fn summaries(records: Vec<CertificateRecord>) -> Response {
    let now = OffsetDateTime::now_utc();
    let list: Vec<CertificateSummary> = records.iter().map(|r| r.summary(now)).collect();
    warp::reply::json(&list).into_response()
}

fn with_content_type(body: impl Reply, content_type: &'static str) -> Response {
    warp::reply::with_header(body, "content-type", content_type).into_response()
}

/// Runs signing and CSR verification off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, Rejection>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(reject),
        Err(e) => {
            error!(error = %e, "blocking task failed");
            Err(reject(CaError::Storage("worker task failed".into())))
        }
    }
}

fn with_authority(
    ca: Arc<CertificateAuthority>,
) -> impl Filter<Extract = (Arc<CertificateAuthority>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&ca))
}

fn with_actor() -> impl Filter<Extract = (Actor,), Error = Rejection> + Clone {
    warp::header::optional::<String>("x-actor-id")
        .and(warp::header::optional::<String>("x-actor-role"))
        .and(warp::header::optional::<String>("x-actor-organization"))
        .and_then(
            |id: Option<String>, role: Option<String>, organization: Option<String>| async move {
                let (Some(id), Some(role)) = (id, role) else {
                    return Err(warp::reject::custom(MissingActor));
                };
                let role: Role = role.parse().map_err(reject)?;
                Ok(Actor::new(id, role, organization.as_deref()))
            },
        )
}

/// All routes with tracing and error mapping applied.
pub fn routes(
    ca: Arc<CertificateAuthority>,
) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    certificate_routes(Arc::clone(&ca))
        .or(template_routes(Arc::clone(&ca)))
        .unify()
        .or(audit_route(Arc::clone(&ca)))
        .unify()
        .or(crl_route(ca))
        .unify()
        .with(warp::trace::request())
        .map(Reply::into_response)
        .recover(handle_rejection)
        .unify()
}

pub async fn serve(ca: Arc<CertificateAuthority>, addr: SocketAddr) {
    info!(%addr, "starting certificate authority API");
    warp::serve(routes(ca)).run(addr).await;
}

fn certificate_routes(ca: Arc<CertificateAuthority>) -> BoxedFilter<(Response,)> {
    let root = warp::path!("certificates" / "root")
        .and(warp::post())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and(warp::body::json())
        .and_then(handle_issue_root);

    let intermediate = warp::path!("certificates" / "intermediate")
        .and(warp::post())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and(warp::body::json())
        .and_then(handle_issue_intermediate);

    let end_entity = warp::path!("certificates" / "end-entity" / "csr")
        .and(warp::post())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and(warp::body::json())
        .and_then(handle_issue_end_entity);

    let issuers = warp::path!("certificates" / "issuers")
        .and(warp::get())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and_then(handle_issuers);

    let my_chain = warp::path!("certificates" / "my-chain")
        .and(warp::get())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and_then(handle_my_chain);

    let tree = warp::path!("certificates" / "my-chain" / "tree")
        .and(warp::get())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and_then(handle_chain_tree);

    let get = warp::path!("certificates" / u64)
        .and(warp::get())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and_then(handle_get_certificate);

    let revoke = warp::path!("certificates" / u64 / "revoke")
        .and(warp::post())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and(warp::body::json())
        .and_then(handle_revoke);

    let valid = warp::path!("certificates" / u64 / "valid")
        .and(warp::get())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and_then(handle_valid);

    let download = warp::path!("certificates" / u64 / "download")
        .and(warp::get())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and_then(handle_download_pem);

    let download_ee = warp::path!("certificates" / "end-entity" / "download" / String)
        .and(warp::get())
        .and(with_authority(ca))
        .and(with_actor())
        .and_then(handle_download_end_entity);

    root.or(intermediate)
        .unify()
        .or(end_entity)
        .unify()
        .or(issuers)
        .unify()
        .or(my_chain)
        .unify()
        .or(tree)
        .unify()
        .or(get)
        .unify()
        .or(revoke)
        .unify()
        .or(valid)
        .unify()
        .or(download)
        .unify()
        .or(download_ee)
        .unify()
        .boxed()
}

fn template_routes(ca: Arc<CertificateAuthority>) -> BoxedFilter<(Response,)> {
    let list = warp::path!("templates")
        .and(warp::get())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and_then(handle_list_templates);

    let create = warp::path!("templates")
        .and(warp::post())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and(warp::body::json())
        .and_then(handle_create_template);

    let get = warp::path!("templates" / u64)
        .and(warp::get())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and_then(handle_get_template);

    let update = warp::path!("templates" / u64)
        .and(warp::put())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and(warp::body::json())
        .and_then(handle_update_template);

    let delete = warp::path!("templates" / u64)
        .and(warp::delete())
        .and(with_authority(Arc::clone(&ca)))
        .and(with_actor())
        .and_then(handle_delete_template);

    let use_template = warp::path!("templates" / u64 / "use")
        .and(warp::post())
        .and(with_authority(ca))
        .and(with_actor())
        .and(warp::body::json())
        .and_then(handle_use_template);

    list.or(create)
        .unify()
        .or(get)
        .unify()
        .or(update)
        .unify()
        .or(delete)
        .unify()
        .or(use_template)
        .unify()
        .boxed()
}

fn audit_route(ca: Arc<CertificateAuthority>) -> BoxedFilter<(Response,)> {
    warp::path!("audit" / "logs")
        .and(warp::get())
        .and(with_authority(ca))
        .and(with_actor())
        .and(warp::query::<AuditFilter>())
        .and_then(handle_audit_logs)
        .boxed()
}

fn crl_route(ca: Arc<CertificateAuthority>) -> BoxedFilter<(Response,)> {
    warp::path!("crl" / String)
        .and(warp::get())
        .and(with_authority(ca))
        .and_then(handle_crl)
        .boxed()
}

async fn handle_issue_root(
    ca: Arc<CertificateAuthority>,
    actor: Actor,
    body: CaCertificateBody,
) -> Result<Response, Rejection> {
    let record = blocking(move || {
        let extensions = RequestedExtensions {
            basic_constraints: match body.basic_constraints {
                Some(text) => text.parse()?,
                None => BasicConstraints::ca(None),
            },
            key_usage: parse_key_usage(body.key_usage)?,
            extended_key_usage: parse_extended_key_usage(body.extended_key_usage)?,
            subject_alt_names: body.subject_alt_names,
        };
        ca.issue_root(&actor, body.subject, validity(body.valid_from, body.valid_to), extensions)
    })
    .await?;
    Ok(issued(record))
}

async fn handle_issue_intermediate(
    ca: Arc<CertificateAuthority>,
    actor: Actor,
    body: CaCertificateBody,
) -> Result<Response, Rejection> {
    let record = blocking(move || {
        let issuer_id = body
            .issuer_certificate_id
            .ok_or_else(|| CaError::validation("issuerCertificateId", "is required"))?;
        let extensions = RequestedExtensions {
            basic_constraints: match body.basic_constraints {
                Some(text) => text.parse()?,
                None => BasicConstraints::ca(None),
            },
            key_usage: parse_key_usage(body.key_usage)?,
            extended_key_usage: parse_extended_key_usage(body.extended_key_usage)?,
            subject_alt_names: body.subject_alt_names,
        };
        ca.issue_intermediate(
            &actor,
            issuer_id,
            body.subject,
            validity(body.valid_from, body.valid_to),
            extensions,
            body.template_id,
        )
    })
    .await?;
    Ok(issued(record))
}

async fn handle_issue_end_entity(
    ca: Arc<CertificateAuthority>,
    actor: Actor,
    body: EndEntityBody,
) -> Result<Response, Rejection> {
    let record = blocking(move || {
        let extensions = RequestedExtensions {
            basic_constraints: BasicConstraints::end_entity(),
            key_usage: parse_key_usage(body.key_usage)?,
            extended_key_usage: parse_extended_key_usage(body.extended_key_usage)?,
            subject_alt_names: body.subject_alt_names,
        };
        ca.issue_end_entity(
            &actor,
            body.issuer_certificate_id,
            &body.csr_pem,
            validity(body.valid_from, body.valid_to),
            extensions,
            body.template_id,
        )
    })
    .await?;
    Ok(issued(record))
}

async fn handle_issuers(ca: Arc<CertificateAuthority>, actor: Actor) -> Result<Response, Rejection> {
    Ok(summaries(ca.eligible_issuers(&actor).map_err(reject)?))
}

async fn handle_my_chain(ca: Arc<CertificateAuthority>, actor: Actor) -> Result<Response, Rejection> {
    Ok(summaries(ca.my_chain(&actor).map_err(reject)?))
}

async fn handle_chain_tree(ca: Arc<CertificateAuthority>, actor: Actor) -> Result<Response, Rejection> {
    let forest = ca.chain_tree(&actor).map_err(reject)?;
    Ok(warp::reply::json(&forest).into_response())
}

async fn handle_get_certificate(
    id: u64,
    ca: Arc<CertificateAuthority>,
    actor: Actor,
) -> Result<Response, Rejection> {
    let record = ca.certificate(&actor, CertificateId(id)).map_err(reject)?;
    Ok(warp::reply::json(&record.summary(OffsetDateTime::now_utc())).into_response())
}

async fn handle_revoke(
    id: u64,
    ca: Arc<CertificateAuthority>,
    actor: Actor,
    body: RevokeBody,
) -> Result<Response, Rejection> {
    let reason: RevocationReason = body.reason.parse().map_err(reject)?;
    let record = blocking(move || ca.revoke(&actor, CertificateId(id), reason)).await?;
    Ok(warp::reply::json(&record.summary(OffsetDateTime::now_utc())).into_response())
}

async fn handle_valid(
    id: u64,
    ca: Arc<CertificateAuthority>,
    _actor: Actor,
) -> Result<Response, Rejection> {
    let valid = ca.is_chain_valid(CertificateId(id)).map_err(reject)?;
    Ok(warp::reply::json(&ValidBody { valid }).into_response())
}

async fn handle_download_pem(
    id: u64,
    ca: Arc<CertificateAuthority>,
    actor: Actor,
) -> Result<Response, Rejection> {
    let pem = ca.certificate_pem(&actor, CertificateId(id)).map_err(reject)?;
    Ok(with_content_type(pem, PEM_CONTENT_TYPE))
}

async fn handle_download_end_entity(
    serial_number: String,
    ca: Arc<CertificateAuthority>,
    actor: Actor,
) -> Result<Response, Rejection> {
    let der = ca.end_entity_der(&actor, &serial_number).map_err(reject)?;
    Ok(with_content_type(der, DER_CONTENT_TYPE))
}

async fn handle_crl(file_name: String, ca: Arc<CertificateAuthority>) -> Result<Response, Rejection> {
    let Some(serial_number) = file_name.strip_suffix(".crl").map(str::to_string) else {
        return Err(warp::reject::not_found());
    };
    let der = blocking(move || ca.crl(&serial_number)?.to_der()).await?;
    Ok(with_content_type(der, CRL_CONTENT_TYPE))
}

async fn handle_list_templates(ca: Arc<CertificateAuthority>, actor: Actor) -> Result<Response, Rejection> {
    let views: Vec<TemplateView> = ca
        .templates(&actor)
        .map_err(reject)?
        .into_iter()
        .map(TemplateView::from)
        .collect();
    Ok(warp::reply::json(&views).into_response())
}

async fn handle_create_template(
    ca: Arc<CertificateAuthority>,
    actor: Actor,
    body: TemplateBody,
) -> Result<Response, Rejection> {
    let policy = body.into_policy().map_err(reject)?;
    let template = ca.create_template(&actor, policy).map_err(reject)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&TemplateView::from(template)),
        StatusCode::CREATED,
    )
    .into_response())
}

async fn handle_get_template(
    id: u64,
    ca: Arc<CertificateAuthority>,
    actor: Actor,
) -> Result<Response, Rejection> {
    let template = ca.template(&actor, TemplateId(id)).map_err(reject)?;
    Ok(warp::reply::json(&TemplateView::from(template)).into_response())
}

async fn handle_update_template(
    id: u64,
    ca: Arc<CertificateAuthority>,
    actor: Actor,
    body: TemplateBody,
) -> Result<Response, Rejection> {
    let policy = body.into_policy().map_err(reject)?;
    let template = ca
        .update_template(&actor, TemplateId(id), policy)
        .map_err(reject)?;
    Ok(warp::reply::json(&TemplateView::from(template)).into_response())
}

async fn handle_delete_template(
    id: u64,
    ca: Arc<CertificateAuthority>,
    actor: Actor,
) -> Result<Response, Rejection> {
    ca.delete_template(&actor, TemplateId(id)).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_use_template(
    id: u64,
    ca: Arc<CertificateAuthority>,
    actor: Actor,
    body: UseTemplateBody,
) -> Result<Response, Rejection> {
    let request = ca
        .use_template(&actor, TemplateId(id), body.subject, body.subject_alt_names)
        .map_err(reject)?;
    Ok(warp::reply::json(&IssuanceRequestView::from(request)).into_response())
}

async fn handle_audit_logs(
    ca: Arc<CertificateAuthority>,
    actor: Actor,
    filter: AuditFilter,
) -> Result<Response, Rejection> {
    let page = ca.audit_events(&actor, &filter).map_err(reject)?;
    Ok(warp::reply::json(&page).into_response())
}

fn status_for(err: &CaError) -> StatusCode {
    match err {
        CaError::Validation { .. }
        | CaError::PatternMismatch { .. }
        | CaError::InvalidCsr(_)
        | CaError::InvalidCsrSignature => StatusCode::BAD_REQUEST,
        CaError::IssuerNotEligible(_) | CaError::IssuerExpiredOrRevoked(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        CaError::AlreadyRevoked | CaError::AlreadyExists { .. } => StatusCode::CONFLICT,
        CaError::Forbidden | CaError::CannotRevokeRoot => StatusCode::FORBIDDEN,
        CaError::NotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(err: &CaError) -> ErrorBody {
    let status = status_for(err);
    let error = match status {
        StatusCode::FORBIDDEN => "Forbidden".to_string(),
        StatusCode::INTERNAL_SERVER_ERROR => "Internal Server Error".to_string(),
        _ => err.to_string(),
    };
    let field = match err {
        CaError::Validation { field, .. } | CaError::PatternMismatch { field, .. } => {
            Some(field.clone())
        }
        _ => None,
    };
    ErrorBody { error, field }
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (code, body) = if let Some(ApiError(e)) = err.find::<ApiError>() {
        let code = status_for(e);
        if code == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %e, "request failed");
        }
        (code, error_body(e))
    } else if err.find::<MissingActor>().is_some() {
        (
            StatusCode::UNAUTHORIZED,
            ErrorBody {
                error: "Missing actor headers".into(),
                field: None,
            },
        )
    } else if err.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            ErrorBody {
                error: "Not Found".into(),
                field: None,
            },
        )
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            ErrorBody {
                error: format!("Invalid JSON body: {e}"),
                field: None,
            },
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorBody {
                error: "Method Not Allowed".into(),
                field: None,
            },
        )
    } else {
        error!(rejection = ?err, "unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody {
                error: "Internal Server Error".into(),
                field: None,
            },
        )
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), code).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditPage};
    use crate::config::AuthorityConfig;
    use crate::csr::create_csr_pem;
    use crate::key::{KeyPair, PublicKey};
    use crate::pem_utils::{CSR_LABELS, der_to_pem, pem_to_der};
    use der::{Decode, Encode};
    use serde_json::json;
    use x509_cert::request::CertReq;
    use warp::test;

    fn authority() -> Arc<CertificateAuthority> {
        Arc::new(CertificateAuthority::new(&AuthorityConfig::default()))
    }

    fn in_days(days: i64) -> String {
        (OffsetDateTime::now_utc() + time::Duration::days(days))
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap()
    }

    async fn issue_root(filter: &(impl Filter<Extract = (Response,), Error = Infallible> + Clone + 'static)) -> IssuedBody {
        let response = test::request()
            .method("POST")
            .path("/certificates/root")
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .json(&json!({
                "commonName": "Test Root",
                "organization": "Acme",
                "country": "RS",
                "validTo": in_days(3650),
                "keyUsage": [true, false, false, false, false, true, true, false, false],
                "basicConstraints": "CA:TRUE, pathlen:2"
            }))
            .reply(filter)
            .await;
        assert_eq!(response.status(), 201, "{:?}", response.body());
        serde_json::from_slice(response.body()).unwrap()
    }

    #[tokio::test]
    async fn test_issue_root_and_download() {
        let filter = routes(authority());
        let root = issue_root(&filter).await;
        assert_eq!(root.certificate.basic_constraints, "CA:TRUE, pathlen:2");
        assert_eq!(root.certificate.key_usage.len(), 9);

        let response = test::request()
            .method("GET")
            .path(&format!("/certificates/{}/download", root.certificate.id))
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);
        assert!(String::from_utf8_lossy(response.body()).starts_with("-----BEGIN CERTIFICATE-----"));

        let response = test::request()
            .method("GET")
            .path(&format!("/crl/{}.crl", root.serial_number))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], CRL_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let filter = routes(authority());
        let root = issue_root(&filter).await;

        let response = test::request()
            .method("POST")
            .path("/certificates/root")
            .header("x-actor-id", "carol")
            .header("x-actor-role", "CA")
            .json(&json!({"commonName": "X", "organization": "Acme", "country": "RS", "validTo": in_days(10)}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 403);
        let body: ErrorBody = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.error, "Forbidden");

        let response = test::request()
            .method("POST")
            .path("/certificates/root")
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .json(&json!({
                "commonName": "Bad usage",
                "organization": "Acme",
                "country": "RS",
                "validTo": in_days(10),
                "keyUsage": [true, false]
            }))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 400);

        let response = test::request()
            .method("POST")
            .path(&format!("/certificates/{}/revoke", root.certificate.id))
            .header("x-actor-id", "carol")
            .header("x-actor-role", "CA")
            .header("x-actor-organization", "Acme")
            .json(&json!({"reason": "keyCompromise"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 403);

        let response = test::request()
            .method("GET")
            .path("/certificates/999")
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 404);

        let response = test::request().method("GET").path("/certificates/my-chain").reply(&filter).await;
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn test_end_entity_flow() {
        let filter = routes(authority());
        let root = issue_root(&filter).await;
        let subject = DistinguishedName::builder()
            .common_name("alice".to_string())
            .organization("Acme".to_string())
            .country("RS".to_string())
            .build();
        let csr = create_csr_pem(&subject, &KeyPair::generate_ecdsa_p256(), &["alice.example.com".to_string()]).unwrap();

        let response = test::request()
            .method("POST")
            .path("/certificates/end-entity/csr")
            .header("x-actor-id", "alice")
            .header("x-actor-role", "BASIC")
            .json(&json!({
                "csrPem": csr,
                "issuerCertificateId": root.certificate.id,
                "validTo": in_days(30)
            }))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 201, "{:?}", response.body());
        let leaf: IssuedBody = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(leaf.certificate.subject_alt_names, vec!["alice.example.com".to_string()]);

        let response = test::request()
            .method("GET")
            .path(&format!("/certificates/end-entity/download/{}", leaf.serial_number))
            .header("x-actor-id", "alice")
            .header("x-actor-role", "BASIC")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], DER_CONTENT_TYPE);

        let response = test::request()
            .method("POST")
            .path(&format!("/certificates/{}/revoke", leaf.certificate.id))
            .header("x-actor-id", "alice")
            .header("x-actor-role", "BASIC")
            .json(&json!({"reason": "superseded"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);

        let response = test::request()
            .method("POST")
            .path(&format!("/certificates/{}/revoke", leaf.certificate.id))
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .json(&json!({"reason": "keyCompromise"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 409);

        let response = test::request()
            .method("GET")
            .path(&format!("/certificates/{}/valid", leaf.certificate.id))
            .header("x-actor-id", "alice")
            .header("x-actor-role", "BASIC")
            .reply(&filter)
            .await;
        let body: ValidBody = serde_json::from_slice(response.body()).unwrap();
        assert!(!body.valid);

        let response = test::request()
            .method("GET")
            .path("/certificates/issuers")
            .header("x-actor-id", "alice")
            .header("x-actor-role", "BASIC")
            .reply(&filter)
            .await;
        let issuers: Vec<CertificateSummary> = serde_json::from_slice(response.body()).unwrap();
        assert!(issuers.is_empty());
    }

    #[tokio::test]
    async fn test_template_routes() {
        let filter = routes(authority());
        let root = issue_root(&filter).await;

        let response = test::request()
            .method("POST")
            .path("/templates")
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .json(&json!({
                "name": "web",
                "caIssuerId": root.certificate.id,
                "commonNameRegex": "^host-[0-9]+$",
                "maxValidityDays": 90,
                "keyUsage": [true, false, true, false, false, false, false, false, false],
                "extendedKeyUsage": "serverAuth"
            }))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 201, "{:?}", response.body());
        let template: TemplateView = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(template.basic_constraints, "CA:FALSE");

        let response = test::request()
            .method("POST")
            .path(&format!("/templates/{}/use", template.id))
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .json(&json!({"commonName": "host-42", "organization": "Acme", "country": "RS"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200);
        let prefilled: IssuanceRequestView = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(prefilled.issuer_certificate_id, root.certificate.id);
        assert_eq!(prefilled.extended_key_usage, "serverAuth");

        let response = test::request()
            .method("POST")
            .path(&format!("/templates/{}/use", template.id))
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .json(&json!({"commonName": "bad host", "organization": "Acme", "country": "RS"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 400);
        let body: ErrorBody = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.field.as_deref(), Some("commonName"));

        let response = test::request()
            .method("DELETE")
            .path(&format!("/templates/{}", template.id))
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 204);
    }

    #[tokio::test]
    async fn test_audit_logs_are_admin_only() {
        let filter = routes(authority());
        let root = issue_root(&filter).await;

        let response = test::request()
            .method("POST")
            .path("/certificates/root")
            .header("x-actor-id", "carol")
            .header("x-actor-role", "CA")
            .json(&json!({"commonName": "Rogue", "organization": "Acme", "country": "RS", "validTo": in_days(10)}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 403);

        let response = test::request()
            .method("GET")
            .path("/audit/logs")
            .header("x-actor-id", "carol")
            .header("x-actor-role", "CA")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 403);

        let response = test::request()
            .method("GET")
            .path("/audit/logs?outcome=DENIED")
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 200, "{:?}", response.body());
        let page: AuditPage = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].actor_id, "carol");
        assert_eq!(page.events[0].action, AuditAction::IssueRoot);

        let response = test::request()
            .method("GET")
            .path("/audit/logs?actorId=admin&limit=1")
            .header("x-actor-id", "admin")
            .header("x-actor-role", "ADMIN")
            .reply(&filter)
            .await;
        let page: AuditPage = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].target, format!("certificate:{}", root.certificate.id));
    }

    #[tokio::test]
    async fn test_tampered_csr_is_bad_request() {
        let ca = authority();
        let filter = routes(Arc::clone(&ca));
        let root = issue_root(&filter).await;
        let subject = DistinguishedName::builder()
            .common_name("alice".to_string())
            .organization("Acme".to_string())
            .country("RS".to_string())
            .build();
        let csr = create_csr_pem(&subject, &KeyPair::generate_ecdsa_p256(), &[]).unwrap();
        let mut request = CertReq::from_der(&pem_to_der(&csr, &CSR_LABELS).unwrap()).unwrap();
        request.info.public_key = PublicKey::from_key_pair(&KeyPair::generate_ecdsa_p256())
            .to_spki()
            .unwrap();
        let tampered = der_to_pem(&request.to_der().unwrap(), CSR_LABELS[0]);

        let admin = Actor::new("admin", Role::Admin, None);
        let before = ca.my_chain(&admin).unwrap();
        let response = test::request()
            .method("POST")
            .path("/certificates/end-entity/csr")
            .header("x-actor-id", "alice")
            .header("x-actor-role", "BASIC")
            .json(&json!({
                "csrPem": tampered,
                "issuerCertificateId": root.certificate.id,
                "validTo": in_days(30)
            }))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), 400);
        let body: ErrorBody = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.error, CaError::InvalidCsrSignature.to_string());
        assert_eq!(ca.my_chain(&admin).unwrap(), before);
    }
}
