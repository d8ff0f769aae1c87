//! Method and path dispatch
//!
//! Routes live in a segment trie built once at startup and shared read-only
//! by every worker. A path segment starting with `^` captures the matching
//! request segment into `request.params` under the name after the caret,
//! e.g. `/users/^id` matches `/users/42` with `id=42`.

use crate::codec::{self, Method, Request, Response};
use crate::error::HttpError;
use std::collections::HashMap;
use std::rc::Rc;
use strand_core::{kerror, Arena};

/// Handlers are plain functions so the router is `Send + Sync` without
/// locking. Per-request state belongs in the arena, not in the handler.
pub type Handler = fn(&Rc<Arena>, &Request, &mut Response) -> Result<(), HttpError>;

#[derive(Clone)]
pub struct Route {
    pub method: Method,
    pub path: &'static str,
    pub handler: Handler,
}

struct Node {
    children: HashMap<Vec<u8>, Node>,
    capture: Option<Box<Node>>,
    routes: [Option<Route>; Method::COUNT],
}

impl Node {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            capture: None,
            routes: [const { None }; Method::COUNT],
        }
    }
}

pub struct Router {
    root: Node,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self { root: Node::new() }
    }

    /// Register a handler. A later registration for the same method and path
    /// replaces the earlier one.
    pub fn add(&mut self, method: Method, path: &'static str, handler: Handler) -> &mut Self {
        let mut node = &mut self.root;
        for segment in path.as_bytes().split(|&b| b == b'/') {
            if segment.is_empty() {
                continue;
            }
            node = if segment[0] == b'^' {
                node.capture.get_or_insert_with(|| Box::new(Node::new()))
            } else {
                node.children
                    .entry(segment.to_vec())
                    .or_insert_with(Node::new)
            };
        }
        node.routes[method.index()] = Some(Route {
            method,
            path,
            handler,
        });
        self
    }

    /// Walk the trie; literal segments win over captures.
    fn lookup(&self, method: Method, path: &[u8]) -> Option<&Route> {
        let mut node = &self.root;
        for segment in path.split(|&b| b == b'/') {
            if segment.is_empty() {
                continue;
            }
            node = match node.children.get(segment) {
                Some(child) => child,
                None => node.capture.as_deref()?,
            };
        }
        node.routes[method.index()].as_ref()
    }

    /// Dispatch a validated request. Unmatched paths get a 404 page, a
    /// handler error is logged and becomes a 500 page.
    pub fn handle(
        &self,
        arena: &Rc<Arena>,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<(), HttpError> {
        let path = request.uri.path.resolve(arena).to_vec();
        let Some(route) = self.lookup(request.method, &path) else {
            codec::write_status(response, 404)?;
            return Ok(());
        };
        codec::parse_uriparams(&mut request.params, &path, route.path.as_bytes())?;

        if let Err(e) = (route.handler)(arena, request, response) {
            kerror!(
                "handler {} {} failed: {}",
                request.method.as_str(),
                String::from_utf8_lossy(&path),
                e
            );
            codec::write_status(response, 500)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::kib;

    fn arena() -> Rc<Arena> {
        Rc::new(Arena::new(kib(4), kib(256)).unwrap())
    }

    fn ok_root(_: &Rc<Arena>, _: &Request, resp: &mut Response) -> Result<(), HttpError> {
        resp.body.write(b"root")?;
        Ok(())
    }

    fn ok_user(_: &Rc<Arena>, req: &Request, resp: &mut Response) -> Result<(), HttpError> {
        let id = req.params.get(b"id").unwrap_or(b"?");
        resp.body.write(id)?;
        Ok(())
    }

    fn fails(_: &Rc<Arena>, _: &Request, _: &mut Response) -> Result<(), HttpError> {
        Err(HttpError::Malformed)
    }

    fn request_for(a: &Rc<Arena>, method: Method, path: &[u8]) -> Request {
        let mut req = Request::new(a.clone());
        let mut line = Vec::from(method.as_str().as_bytes());
        line.push(b' ');
        line.extend_from_slice(path);
        line.extend_from_slice(b" HTTP/1.1");
        codec::parse_reqline(a, &mut req, &line).unwrap();
        req
    }

    fn router() -> Router {
        let mut r = Router::new();
        r.add(Method::Get, "/", ok_root)
            .add(Method::Get, "/users/^id", ok_user)
            .add(Method::Put, "/fail", fails);
        r
    }

    #[test]
    fn test_dispatch_literal_and_capture() {
        let a = arena();
        let r = router();

        let mut req = request_for(&a, Method::Get, b"/");
        let mut resp = Response::new(a.clone()).unwrap();
        r.handle(&a, &mut req, &mut resp).unwrap();
        assert_eq!(resp.body.as_slice(), b"root");

        let mut req = request_for(&a, Method::Get, b"/users/42");
        let mut resp = Response::new(a.clone()).unwrap();
        r.handle(&a, &mut req, &mut resp).unwrap();
        assert_eq!(resp.body.as_slice(), b"42");
        assert_eq!(req.params.get(b"id"), Some(&b"42"[..]));
    }

    #[test]
    fn test_unmatched_is_404() {
        let a = arena();
        let r = router();

        let mut req = request_for(&a, Method::Get, b"/nope");
        let mut resp = Response::new(a.clone()).unwrap();
        r.handle(&a, &mut req, &mut resp).unwrap();
        assert_eq!(resp.status, 404);

        // Same path, unregistered method.
        let mut req = request_for(&a, Method::Post, b"/");
        let mut resp = Response::new(a.clone()).unwrap();
        r.handle(&a, &mut req, &mut resp).unwrap();
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn test_handler_error_is_500() {
        let a = arena();
        let r = router();
        let mut req = request_for(&a, Method::Put, b"/fail");
        let mut resp = Response::new(a.clone()).unwrap();
        r.handle(&a, &mut req, &mut resp).unwrap();
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body.as_slice(), b"500 Internal Server Error\n");
    }
}
