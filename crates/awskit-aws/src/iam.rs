//! IAM over the Query protocol (API version 2010-05-08).
//!
//! IAM is global: requests go to the partition endpoint and are signed for
//! the partition's home region.

use crate::client::{self, required_param, HttpRequest, HttpResponse};
use crate::xml::XmlNode;
use awskit_core::operation::IamOp;
use awskit_core::{ParamsExt, ProviderCall, ProviderError, ProviderResponse};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "2010-05-08";

pub fn query_params(op: IamOp, call: &ProviderCall<'_>) -> Result<BTreeMap<String, String>, ProviderError> {
    let params = call.params;
    let mut q = client::build_query_params(op.descriptor().provider_call, API_VERSION);

    if op.descriptor().listing {
        if let Some(size) = client::clamp_page_size(call.page_size, 1, 1000) {
            q.insert("MaxItems".to_string(), size);
        }
        if let Some(cursor) = call.cursor {
            q.insert("Marker".to_string(), cursor.to_string());
        }
        if let Some(prefix) = params.str_param("path_prefix") {
            if matches!(op, IamOp::ListUsers | IamOp::ListRoles) {
                q.insert("PathPrefix".to_string(), prefix.to_string());
            }
        }
    }

    let user_param = |q: &mut BTreeMap<String, String>| -> Result<(), ProviderError> {
        q.insert("UserName".to_string(), required_param(params, "user_name")?.to_string());
        Ok(())
    };
    let role_and_policy = |q: &mut BTreeMap<String, String>| -> Result<(), ProviderError> {
        q.insert("RoleName".to_string(), required_param(params, "role_name")?.to_string());
        q.insert("PolicyArn".to_string(), required_param(params, "policy_arn")?.to_string());
        Ok(())
    };

    match op {
        IamOp::ListUsers | IamOp::ListRoles => {}
        IamOp::ListAccessKeys => {
            if let Some(user) = params.str_param("user_name") {
                q.insert("UserName".to_string(), user.to_string());
            }
        }
        IamOp::CreateUser => {
            q.insert("UserName".to_string(), required_param(params, "user_name")?.to_string());
            if let Some(path) = params.str_param("path") {
                q.insert("Path".to_string(), path.to_string());
            }
            client::add_tags(&mut q, &params.string_map("tags"), "Tags.member");
        }
        IamOp::DeleteUser => {
            q.insert("UserName".to_string(), required_param(params, "user_name")?.to_string());
        }
        IamOp::AttachUserPolicy | IamOp::DetachUserPolicy => {
            user_param(&mut q)?;
            q.insert("PolicyArn".to_string(), required_param(params, "policy_arn")?.to_string());
        }
        IamOp::CreateRole => {
            q.insert("RoleName".to_string(), required_param(params, "role_name")?.to_string());
            let document = match params.get("assume_role_policy") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => return Err(ProviderError::new("ValidationError", "missing required parameter: assume_role_policy")),
            };
            q.insert("AssumeRolePolicyDocument".to_string(), document);
            q.insert("Path".to_string(), params.str_param("path").unwrap_or("/").to_string());
            if let Some(description) = params.str_param("description") {
                q.insert("Description".to_string(), description.to_string());
            }
            client::add_tags(&mut q, &params.string_map("tags"), "Tags.member");
        }
        IamOp::DeleteRole => {
            q.insert("RoleName".to_string(), required_param(params, "role_name")?.to_string());
        }
        IamOp::AttachRolePolicy | IamOp::DetachRolePolicy => role_and_policy(&mut q)?,
        IamOp::CreateAccessKey | IamOp::ListUserPolicies => user_param(&mut q)?,
        IamOp::DeleteAccessKey => {
            q.insert("AccessKeyId".to_string(), required_param(params, "access_key_id")?.to_string());
            if let Some(name) = params.str_param("user_name") {
                q.insert("UserName".to_string(), name.to_string());
            }
        }
        IamOp::ListRolePolicies => {
            q.insert("RoleName".to_string(), required_param(params, "role_name")?.to_string());
        }
    }
    Ok(q)
}

pub fn build(op: IamOp, call: &ProviderCall<'_>) -> Result<HttpRequest, ProviderError> {
    Ok(HttpRequest::query_api(&query_params(op, call)?))
}

pub fn parse(op: IamOp, call: &ProviderCall<'_>, response: &HttpResponse) -> Result<ProviderResponse, ProviderError> {
    parse_body(op, call, &response.text())
}

pub fn parse_body(op: IamOp, call: &ProviderCall<'_>, body: &str) -> Result<ProviderResponse, ProviderError> {
    let root = XmlNode::parse(body)?;
    let result = root.result(op.descriptor().provider_call);
    // IAM repeats the last marker on the final page; only IsTruncated is reliable.
    let marker = || {
        if result.text_of("IsTruncated") == Some("true") {
            result.text_of("Marker").map(String::from)
        } else {
            None
        }
    };
    let user_name = call.params.str_param("user_name").unwrap_or("");
    let role_name = call.params.str_param("role_name").unwrap_or("");
    let policy_arn = call.params.str_param("policy_arn");

    Ok(match op {
        IamOp::ListUsers => ProviderResponse::page(result.list("Users", "member").into_iter().map(user).collect(), marker()),
        IamOp::ListRoles => ProviderResponse::page(result.list("Roles", "member").into_iter().map(role).collect(), marker()),
        IamOp::ListAccessKeys => {
            let items = result
                .list("AccessKeyMetadata", "member")
                .into_iter()
                .map(|k| {
                    json!({
                        "user_name": k.string("UserName"),
                        "access_key_id": k.string("AccessKeyId"),
                        "status": k.string("Status"),
                        "create_date": k.string("CreateDate"),
                    })
                })
                .collect();
            ProviderResponse::page(items, marker())
        }
        IamOp::CreateUser => {
            let node = result
                .child("User")
                .ok_or_else(|| ProviderError::new("MalformedResponse", "response has no User"))?;
            ProviderResponse::new(user(node))
        }
        IamOp::DeleteUser => ProviderResponse::new(json!({ "user_name": user_name, "deleted": true })),
        IamOp::AttachUserPolicy | IamOp::DetachUserPolicy => ProviderResponse::new(json!({
            "user_name": user_name,
            "policy_arn": policy_arn,
            "attached": op == IamOp::AttachUserPolicy,
        })),
        IamOp::CreateRole => {
            let node = result
                .child("Role")
                .ok_or_else(|| ProviderError::new("MalformedResponse", "response has no Role"))?;
            ProviderResponse::new(role(node))
        }
        IamOp::DeleteRole => ProviderResponse::new(json!({ "role_name": role_name, "deleted": true })),
        IamOp::AttachRolePolicy | IamOp::DetachRolePolicy => ProviderResponse::new(json!({
            "role_name": role_name,
            "policy_arn": policy_arn,
            "attached": op == IamOp::AttachRolePolicy,
        })),
        IamOp::CreateAccessKey => {
            let node = result
                .child("AccessKey")
                .ok_or_else(|| ProviderError::new("MalformedResponse", "response has no AccessKey"))?;
            ProviderResponse::new(json!({
                "user_name": node.string("UserName"),
                "access_key_id": node.string("AccessKeyId"),
                "secret_access_key": node.string("SecretAccessKey"),
                "status": node.string("Status"),
                "create_date": node.string("CreateDate"),
            }))
        }
        IamOp::DeleteAccessKey => ProviderResponse::new(json!({
            "access_key_id": call.params.str_param("access_key_id"),
            "deleted": true,
        })),
        IamOp::ListUserPolicies | IamOp::ListRolePolicies => {
            let items = result
                .list("AttachedPolicies", "member")
                .into_iter()
                .map(|p| {
                    json!({
                        "policy_name": p.string("PolicyName"),
                        "policy_arn": p.string("PolicyArn"),
                    })
                })
                .collect();
            ProviderResponse::page(items, marker())
        }
    })
}

fn user(node: &XmlNode) -> Value {
    json!({
        "user_name": node.string("UserName"),
        "user_id": node.string("UserId"),
        "arn": node.string("Arn"),
        "path": node.string("Path"),
        "create_date": node.string("CreateDate"),
        "password_last_used": node.string("PasswordLastUsed"),
    })
}

fn role(node: &XmlNode) -> Value {
    json!({
        "role_name": node.string("RoleName"),
        "role_id": node.string("RoleId"),
        "arn": node.string("Arn"),
        "path": node.string("Path"),
        "create_date": node.string("CreateDate"),
        "description": node.string("Description"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use awskit_core::operation::Operation;
    use awskit_core::{Credentials, Params};

    fn call<'a>(op: IamOp, params: &'a Params, creds: &'a Credentials) -> ProviderCall<'a> {
        ProviderCall {
            operation: Operation::Iam(op),
            params,
            credentials: creds,
            region: "eu-central-1",
            cursor: Some("prev"),
            page_size: Some(10),
            client_token: None,
        }
    }

    const USERS_PAGE: &str = r#"<ListUsersResponse xmlns="https://iam.amazonaws.com/doc/2010-05-08/">
  <ListUsersResult>
    <IsTruncated>true</IsTruncated>
    <Marker>AAEAAaB</Marker>
    <Users>
      <member><UserName>alice</UserName><UserId>AIDA1</UserId><Arn>arn:aws:iam::123:user/alice</Arn><Path>/</Path></member>
      <member><UserName>bob</UserName><UserId>AIDA2</UserId><Arn>arn:aws:iam::123:user/bob</Arn><Path>/</Path></member>
    </Users>
  </ListUsersResult>
</ListUsersResponse>"#;

    #[test]
    fn list_users_page() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = Params::new();
        let resp = parse_body(IamOp::ListUsers, &call(IamOp::ListUsers, &p, &creds), USERS_PAGE).unwrap();
        assert_eq!(resp.payload.as_array().unwrap().len(), 2);
        assert_eq!(resp.payload[1]["user_name"], "bob");
        assert_eq!(resp.cursor.as_deref(), Some("AAEAAaB"));

        let last = USERS_PAGE.replace("<IsTruncated>true", "<IsTruncated>false");
        let resp = parse_body(IamOp::ListUsers, &call(IamOp::ListUsers, &p, &creds), &last).unwrap();
        assert_eq!(resp.cursor, None);
    }

    #[test]
    fn listing_params_carry_marker() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = Params::new();
        let q = query_params(IamOp::ListRoles, &call(IamOp::ListRoles, &p, &creds)).unwrap();
        assert_eq!(q["Action"], "ListRoles");
        assert_eq!(q["Marker"], "prev");
        assert_eq!(q["MaxItems"], "10");
    }

    #[test]
    fn create_user_params_and_payload() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = serde_json::json!({"user_name": "carol", "path": "/ops/", "tags": {"team": "infra"}})
            .as_object()
            .cloned()
            .unwrap();
        let c = call(IamOp::CreateUser, &p, &creds);
        let q = query_params(IamOp::CreateUser, &c).unwrap();
        assert_eq!(q["UserName"], "carol");
        assert_eq!(q["Path"], "/ops/");
        assert_eq!(q["Tags.member.1.Key"], "team");
        assert!(!q.contains_key("Marker"));

        let xml = "<CreateUserResponse><CreateUserResult><User><UserName>carol</UserName><Arn>arn:aws:iam::123:user/ops/carol</Arn></User></CreateUserResult></CreateUserResponse>";
        let resp = parse_body(IamOp::CreateUser, &c, xml).unwrap();
        assert_eq!(resp.payload["arn"], "arn:aws:iam::123:user/ops/carol");
    }

    #[test]
    fn create_role_serializes_trust_policy() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = serde_json::json!({
            "role_name": "deploy",
            "assume_role_policy": {"Version": "2012-10-17", "Statement": []}
        })
        .as_object()
        .cloned()
        .unwrap();
        let c = call(IamOp::CreateRole, &p, &creds);
        let q = query_params(IamOp::CreateRole, &c).unwrap();
        let document: Value = serde_json::from_str(&q["AssumeRolePolicyDocument"]).unwrap();
        assert_eq!(document["Version"], "2012-10-17");
        assert_eq!(q["Path"], "/");

        let xml = "<CreateRoleResponse><CreateRoleResult><Role><RoleName>deploy</RoleName><RoleId>AROA1</RoleId><Arn>arn:aws:iam::123:role/deploy</Arn></Role></CreateRoleResult></CreateRoleResponse>";
        let resp = parse_body(IamOp::CreateRole, &c, xml).unwrap();
        assert_eq!(resp.payload["role_id"], "AROA1");
    }

    #[test]
    fn detach_role_policy_reports_detached() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = serde_json::json!({"role_name": "deploy", "policy_arn": "arn:aws:iam::aws:policy/ReadOnlyAccess"})
            .as_object()
            .cloned()
            .unwrap();
        let c = call(IamOp::DetachRolePolicy, &p, &creds);
        let q = query_params(IamOp::DetachRolePolicy, &c).unwrap();
        assert_eq!(q["Action"], "DetachRolePolicy");
        assert_eq!(q["RoleName"], "deploy");
        let xml = "<DetachRolePolicyResponse><ResponseMetadata><RequestId>r</RequestId></ResponseMetadata></DetachRolePolicyResponse>";
        let resp = parse_body(IamOp::DetachRolePolicy, &c, xml).unwrap();
        assert_eq!(resp.payload["attached"], false);
    }

    #[test]
    fn create_access_key_returns_secret() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = serde_json::json!({"user_name": "alice"}).as_object().cloned().unwrap();
        let c = call(IamOp::CreateAccessKey, &p, &creds);
        let xml = "<CreateAccessKeyResponse><CreateAccessKeyResult><AccessKey><UserName>alice</UserName><AccessKeyId>AKIANEW</AccessKeyId><SecretAccessKey>s3cr3t</SecretAccessKey><Status>Active</Status></AccessKey></CreateAccessKeyResult></CreateAccessKeyResponse>";
        let resp = parse_body(IamOp::CreateAccessKey, &c, xml).unwrap();
        assert_eq!(resp.payload["access_key_id"], "AKIANEW");
        assert_eq!(resp.payload["secret_access_key"], "s3cr3t");
    }

    #[test]
    fn attached_user_policies_page() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = serde_json::json!({"user_name": "alice"}).as_object().cloned().unwrap();
        let c = call(IamOp::ListUserPolicies, &p, &creds);
        let q = query_params(IamOp::ListUserPolicies, &c).unwrap();
        assert_eq!(q["Action"], "ListAttachedUserPolicies");
        assert_eq!(q["UserName"], "alice");
        assert_eq!(q["Marker"], "prev");

        let xml = r#"<ListAttachedUserPoliciesResponse><ListAttachedUserPoliciesResult>
  <IsTruncated>false</IsTruncated>
  <AttachedPolicies>
    <member><PolicyName>ReadOnlyAccess</PolicyName><PolicyArn>arn:aws:iam::aws:policy/ReadOnlyAccess</PolicyArn></member>
  </AttachedPolicies>
</ListAttachedUserPoliciesResult></ListAttachedUserPoliciesResponse>"#;
        let resp = parse_body(IamOp::ListUserPolicies, &c, xml).unwrap();
        assert_eq!(resp.payload[0]["policy_name"], "ReadOnlyAccess");
        assert_eq!(resp.cursor, None);
    }
}
