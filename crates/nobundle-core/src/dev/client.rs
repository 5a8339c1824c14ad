//! Browser-side HMR runtime, served at `/@hmr`.
//!
//! Exports:
//! - `updateStyle(id, url)` (add or refresh a stylesheet `<link>`)
//! - `hot.accept(owner, deps?, cb?)` (rewritten calls carry their owner)
//!
//! Components are re-instantiated through `__VUE_HMR_RUNTIME__` when the
//! framework exposes it; otherwise the page reloads.

/// WebSocket path the runtime connects to.
pub const HMR_SOCKET_PATH: &str = "/__hmr";

/// The client runtime JavaScript.
#[must_use]
pub fn client_runtime() -> &'static str {
    HMR_CLIENT_RUNTIME
}

const HMR_CLIENT_RUNTIME: &str = r"
// nobundle HMR client runtime
const socketProtocol = location.protocol === 'https:' ? 'wss' : 'ws';
const socket = new WebSocket(`${socketProtocol}://${location.host}/__hmr`);
const jsHotModuleMap = new Map();
const styles = new Map();
let isConnected = false;

socket.addEventListener('open', () => {
  isConnected = true;
});

socket.addEventListener('message', async ({ data }) => {
  const msg = JSON.parse(data);
  const { path, timestamp } = msg;
  switch (msg.type) {
    case 'connected':
      console.log('[nobundle] connected.');
      break;

    case 'style-update':
      updateStyle(msg.id, `${path}?raw&t=${timestamp}`);
      console.log(`[nobundle] ${path} updated.`);
      break;

    case 'js-update':
      await updateModule(path, timestamp);
      break;

    case 'component-reload':
      import(`${path}?t=${timestamp}`).then((m) => {
        if (!window.__VUE_HMR_RUNTIME__) return location.reload();
        __VUE_HMR_RUNTIME__.reload(path, m.default);
        console.log(`[nobundle] ${path} reloaded.`);
      });
      break;

    case 'component-rerender':
      import(`${path}?type=template&t=${timestamp}`).then((m) => {
        if (!window.__VUE_HMR_RUNTIME__) return location.reload();
        __VUE_HMR_RUNTIME__.rerender(path, m.render);
        console.log(`[nobundle] ${path} template updated.`);
      });
      break;

    case 'component-style-update':
      updateStyle(msg.id, `${path}?type=style&index=${msg.index}&t=${timestamp}`);
      console.log(`[nobundle] ${path} style ${msg.index} updated.`);
      break;

    case 'full-reload':
      location.reload();
      break;
  }
});

socket.addEventListener('close', () => {
  if (isConnected) {
    console.log('[nobundle] server connection lost. Polling for restart...');
    isConnected = false;
    setInterval(() => {
      fetch('/').then(() => location.reload()).catch(() => {});
    }, 1000);
  }
});

export function updateStyle(id, url) {
  let link = styles.get(id);
  if (link) {
    link.href = url;
    return;
  }
  link = document.createElement('link');
  link.rel = 'stylesheet';
  link.dataset.nobundleId = id;
  link.href = url;
  document.head.appendChild(link);
  styles.set(id, link);
}

async function updateModule(path, timestamp) {
  const mod = jsHotModuleMap.get(path);
  if (!mod) {
    console.warn(`[nobundle] no hot.accept() registered for ${path}, reloading.`);
    location.reload();
    return;
  }

  const updates = [];
  for (const { deps, callback } of mod.callbacks) {
    updates.push(
      Promise.all(deps.map((dep) => import(`${dep}?t=${timestamp}`)))
        .then((modules) => callback(deps.length === 1 && deps[0] !== path ? modules[0] : modules))
    );
  }
  if (mod.selfAccepted) {
    updates.push(import(`${path}?t=${timestamp}`).then((m) => mod.selfCallback && mod.selfCallback(m)));
  }

  try {
    await Promise.all(updates);
    console.log(`[nobundle] js module hot updated: ${path}`);
  } catch (err) {
    console.error(`[nobundle] hot update of ${path} failed:`, err);
    location.reload();
  }
}

export const hot = {
  accept(owner, deps, callback) {
    const mod = jsHotModuleMap.get(owner) || { selfAccepted: false, callbacks: [] };
    if (deps === undefined || typeof deps === 'function') {
      mod.selfAccepted = true;
      mod.selfCallback = deps;
    } else {
      mod.callbacks.push({
        deps: Array.isArray(deps) ? deps : [deps],
        callback: callback || (() => {}),
      });
    }
    jsHotModuleMap.set(owner, mod);
  },
};
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::hmr::UpdateMessage;

    #[test]
    fn test_runtime_exports_and_socket() {
        let runtime = client_runtime();
        assert!(runtime.contains("export function updateStyle(id, url)"));
        assert!(runtime.contains("export const hot"));
        assert!(runtime.contains(HMR_SOCKET_PATH));
    }

    #[test]
    fn test_runtime_handles_every_message_type() {
        let runtime = client_runtime();
        let messages = [
            UpdateMessage::Connected,
            UpdateMessage::StyleUpdate { id: String::new(), path: String::new(), timestamp: 0 },
            UpdateMessage::JsUpdate { path: String::new(), timestamp: 0 },
            UpdateMessage::ComponentReload { path: String::new(), timestamp: 0 },
            UpdateMessage::ComponentRerender { path: String::new(), timestamp: 0 },
            UpdateMessage::ComponentStyleUpdate {
                path: String::new(),
                index: 0,
                id: String::new(),
                timestamp: 0,
            },
            UpdateMessage::FullReload { path: String::new(), timestamp: 0 },
        ];
        for message in messages {
            let json: serde_json::Value = serde_json::from_str(&message.to_json()).unwrap();
            let kind = json["type"].as_str().unwrap();
            assert!(
                runtime.contains(&format!("case '{kind}':")),
                "runtime does not handle {kind}"
            );
        }
    }
}
