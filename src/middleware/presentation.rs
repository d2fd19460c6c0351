use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_yaml::Value as YamlValue;

use super::BuildContext;
use crate::core::{GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Request, Resource, Response};
use crate::store::DefaultPresentation;
use crate::utils::templates::escape_html;

pub const MIDDLEWARE_NAME: &str = "default_presentation";

pub fn create_default_presentation_middleware(
    _: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    Ok(Arc::new(SetDefaultPresentation))
}

/// Create body preloading a presentation.
fn presentation_body(url: &str) -> Bytes {
    let filename = url
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .unwrap_or_default();
    format!(
        r#"<modules>
   <module name="presentation">
      <document url="{}" filename="{}"/>
   </module>
</modules>"#,
        escape_html(url),
        escape_html(filename)
    )
    .into()
}

fn apply(req: &mut Request, presentation: &DefaultPresentation) {
    if presentation.url.is_empty() || (req.has_body() && !presentation.force) {
        return;
    }
    req.body = Some(presentation_body(&presentation.url));
    req.set_content_type("application/xml");
}

/// Injects the frontend's default presentation into create calls.
pub struct SetDefaultPresentation;

#[async_trait]
impl RequestMiddleware for SetDefaultPresentation {
    fn name(&self) -> &'static str {
        MIDDLEWARE_NAME
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        mut req: Request,
        next: Next<'_>,
    ) -> GatewayResult<Response> {
        let presentation = ctx
            .frontend
            .as_ref()
            .and_then(|f| f.settings.default_presentation.as_ref());
        if let (Resource::Create, Some(presentation)) = (req.resource, presentation) {
            apply(&mut req, presentation);
        }
        next.run(ctx, req).await
    }
}

#[cfg(test)]
mod tests {
    use http::header;

    use super::*;
    use crate::protocol::Params;

    fn presentation(force: bool) -> DefaultPresentation {
        DefaultPresentation {
            url: "https://cdn.example/slides/welcome.pdf".into(),
            force,
        }
    }

    #[test]
    fn test_sets_body_when_missing() {
        let mut req = Request::create(Params::new(), None);
        apply(&mut req, &presentation(false));

        let body = String::from_utf8(req.body.unwrap().to_vec()).unwrap();
        assert!(body.contains(r#"url="https://cdn.example/slides/welcome.pdf""#));
        assert!(body.contains(r#"filename="welcome.pdf""#));
        assert_eq!(req.headers[header::CONTENT_TYPE], "application/xml");
    }

    #[test]
    fn test_keeps_body_unless_forced() {
        let own = Bytes::from_static(b"<modules/>");
        let mut req = Request::create(Params::new(), Some(own.clone()));
        apply(&mut req, &presentation(false));
        assert_eq!(req.body, Some(own.clone()));

        apply(&mut req, &presentation(true));
        assert_ne!(req.body, Some(own));
    }
}
