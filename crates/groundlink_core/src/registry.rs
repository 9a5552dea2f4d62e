//! Registro de tópicos: assinantes por id, em ordem de inscrição.
//!
//! É um objeto explícito (passado por `Arc`), não estado global. Uma falha
//! de assinante (erro retornado ou pânico) é registrada em log e no
//! [`DispatchReport`], e o dispatch segue para os demais.

use crate::codec::{CodecError, TopicId};
use crate::types::TopicMessage;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// De onde veio o frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Publicado nesta estação
    Local,
    /// Recebido do peer via gateway
    Remote,
}

/// Payload de um tópico em trânsito. Vive só durante um dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: TopicId,
    pub payload: Vec<u8>,
    pub origin: Origin,
}

/// Falha de um assinante.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Assinante entrou em pânico: {0}")]
    Panicked(String),

    #[error(transparent)]
    Decode(#[from] CodecError),
}

/// Identifica uma inscrição para `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub topic: TopicId,
    id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub subscription: SubscriptionHandle,
    pub error: HandlerError,
}

/// Resultado de um dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Assinantes que retornaram `Ok`
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

type Handler = Arc<dyn Fn(&Frame) -> Result<(), HandlerError> + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: Handler,
}

/// Mapa tópico → assinantes.
#[derive(Default)]
pub struct TopicRegistry {
    next_id: AtomicU64,
    topics: RwLock<HashMap<TopicId, Vec<Subscriber>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inscreve `handler` no fim da lista do tópico.
    pub fn subscribe<F>(&self, topic: TopicId, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Frame) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(topic)
            .or_default()
            .push(Subscriber {
                id,
                handler: Arc::new(handler),
            });
        debug!("Inscrição {id} no tópico {topic}");
        SubscriptionHandle { topic, id }
    }

    /// Inscrição tipada: o payload é decodificado antes do callback e uma
    /// falha de decodificação conta como falha do assinante.
    pub fn subscribe_message<T, F>(&self, handler: F) -> SubscriptionHandle
    where
        T: TopicMessage,
        F: Fn(T, Origin) + Send + Sync + 'static,
    {
        self.subscribe(T::TOPIC, move |frame| {
            let msg = T::from_payload(&frame.payload)?;
            handler(msg, frame.origin);
            Ok(())
        })
    }

    /// Remove a inscrição. Retorna `false` se ela já não existia.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut topics = self
            .topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(subs) = topics.get_mut(&handle.topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != handle.id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            topics.remove(&handle.topic);
        }
        removed
    }

    pub fn subscriber_count(&self, topic: TopicId) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Entrega `frame` a todos os assinantes atuais do tópico.
    pub fn dispatch(&self, frame: &Frame) -> DispatchReport {
        // Clona os handlers para não segurar o lock durante os callbacks
        let handlers: Vec<(u64, Handler)> = self
            .topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&frame.topic)
            .map(|subs| subs.iter().map(|s| (s.id, Arc::clone(&s.handler))).collect())
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for (id, handler) in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(frame)))
                .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!("Assinante {id} do tópico {} falhou: {error}", frame.topic);
                    report.failures.push(HandlerFailure {
                        subscription: SubscriptionHandle {
                            topic: frame.topic,
                            id,
                        },
                        error,
                    });
                }
            }
        }
        report
    }

    /// Fan-out local. Não depende de transporte.
    pub fn publish(&self, topic: TopicId, payload: Vec<u8>) -> DispatchReport {
        self.dispatch(&Frame {
            topic,
            payload,
            origin: Origin::Local,
        })
    }

    pub fn publish_message<T: TopicMessage>(&self, msg: &T) -> Result<DispatchReport, CodecError> {
        Ok(self.publish(T::TOPIC, msg.to_payload()?))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "pânico sem mensagem".into()
    }
}
