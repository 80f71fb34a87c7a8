//! Bridge script injected into `strict` contexts.
//!
//! The bridge runs inside the context before any sub-application code gets a
//! chance to capture references. It pins the top/parent references to the
//! context itself, namespaces persistent storage and cookies per instance,
//! reports the content height, and signals overlay intent so the host can
//! promote the context while an overlay is open.

use mosaic_core::id::InstanceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker carried by bridge messages.
pub const BRIDGE_MARKER: &str = "__mosaic_bridge";

const NAMESPACE_PLACEHOLDER: &str = "__MOSAIC_NAMESPACE__";
const PARENT_ORIGIN_PLACEHOLDER: &str = "__MOSAIC_PARENT_ORIGIN__";

const BRIDGE_TEMPLATE: &str = r#"(function () {
  'use strict';
  if (window.__mosaicBridge) { return; }
  var NS = __MOSAIC_NAMESPACE__;
  var PARENT_ORIGIN = __MOSAIC_PARENT_ORIGIN__;
  var MARKER = '__mosaic_bridge';
  var hostWindow = window.parent;

  function post(kind, data) {
    var message = { kind: kind };
    message[MARKER] = true;
    for (var key in data) { message[key] = data[key]; }
    hostWindow.postMessage(message, PARENT_ORIGIN);
  }

  // (a) Keep embedded code inside the boundary.
  ['top', 'parent'].forEach(function (name) {
    try {
      Object.defineProperty(window, name, { get: function () { return window; }, configurable: false });
    } catch (e) { /* non-configurable in this engine */ }
  });

  // (b) Namespace persistent storage and cookies.
  function namespaced(storage) {
    var prefix = NS + ':';
    return {
      getItem: function (k) { return storage.getItem(prefix + k); },
      setItem: function (k, v) { storage.setItem(prefix + k, String(v)); },
      removeItem: function (k) { storage.removeItem(prefix + k); },
      clear: function () {
        for (var i = storage.length - 1; i >= 0; i--) {
          var k = storage.key(i);
          if (k && k.indexOf(prefix) === 0) { storage.removeItem(k); }
        }
      },
      key: function (i) {
        var own = [];
        for (var j = 0; j < storage.length; j++) {
          var k = storage.key(j);
          if (k && k.indexOf(prefix) === 0) { own.push(k.slice(prefix.length)); }
        }
        return own[i] === undefined ? null : own[i];
      },
      get length() {
        var n = 0;
        for (var j = 0; j < storage.length; j++) {
          var k = storage.key(j);
          if (k && k.indexOf(prefix) === 0) { n++; }
        }
        return n;
      }
    };
  }
  ['localStorage', 'sessionStorage'].forEach(function (name) {
    try {
      var wrapped = namespaced(window[name]);
      Object.defineProperty(window, name, { get: function () { return wrapped; } });
    } catch (e) { /* storage disabled */ }
  });
  try {
    var cookieDesc = Object.getOwnPropertyDescriptor(Document.prototype, 'cookie');
    var cookiePrefix = NS + '_';
    Object.defineProperty(document, 'cookie', {
      get: function () {
        return cookieDesc.get.call(document).split('; ').filter(function (c) {
          return c.indexOf(cookiePrefix) === 0;
        }).map(function (c) { return c.slice(cookiePrefix.length); }).join('; ');
      },
      set: function (v) { cookieDesc.set.call(document, cookiePrefix + v); }
    });
  } catch (e) { /* cookies disabled */ }

  // (c) Height reporting.
  var lastHeight = -1;
  function reportHeight() {
    var height = Math.ceil(document.documentElement.scrollHeight);
    if (height !== lastHeight) {
      lastHeight = height;
      post('resize', { height: height });
    }
  }
  if (window.ResizeObserver) {
    new ResizeObserver(reportHeight).observe(document.documentElement);
  } else {
    setInterval(reportHeight, 250);
  }
  window.addEventListener('load', reportHeight);

  // (d) Overlay intent.
  var overlayOpen = false;
  function checkOverlay() {
    var open = !!document.querySelector('dialog[open], [aria-modal="true"]');
    if (open !== overlayOpen) {
      overlayOpen = open;
      post('overlay', { open: open });
    }
  }
  new MutationObserver(checkOverlay).observe(document.documentElement, {
    subtree: true, childList: true, attributes: true,
    attributeFilter: ['open', 'aria-modal']
  });

  window.__mosaicBridge = { namespace: NS, reportHeight: reportHeight };
})();
"#;

/// Render the bridge for one instance.
///
/// Both values are embedded as JSON string literals.
pub fn render_bridge(namespace: &str, parent_origin: &str) -> String {
    BRIDGE_TEMPLATE
        .replace(NAMESPACE_PLACEHOLDER, &Value::from(namespace).to_string())
        .replace(PARENT_ORIGIN_PLACEHOLDER, &Value::from(parent_origin).to_string())
}

/// Storage namespace of one instance.
///
/// The name is reduced to cookie-safe characters and suffixed with the
/// instance id, so two instances of one source never share storage.
pub fn storage_namespace(name: &str, id: InstanceId) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        id.uuid().simple().to_string()
    } else {
        format!("{}-{}", cleaned, id.uuid().simple())
    }
}

/// A message posted by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BridgeMessage {
    /// The content height changed.
    Resize {
        /// New height in pixels
        height: u32,
    },

    /// An overlay opened or closed.
    Overlay {
        /// Whether an overlay is open
        open: bool,
    },
}

impl BridgeMessage {
    /// Decode a bridge message, ignoring anything unmarked or malformed.
    pub fn decode(data: &Value) -> Option<Self> {
        let object = data.as_object()?;
        if object.get(BRIDGE_MARKER) != Some(&Value::Bool(true)) {
            return None;
        }
        serde_json::from_value(data.clone()).ok()
    }

    /// Encode with the bridge marker, as the injected script does.
    pub fn encode(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert(BRIDGE_MARKER.to_string(), Value::Bool(true));
        }
        value
    }
}
