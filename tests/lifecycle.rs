//! End-to-end association lifecycles through the public API,
//! against a self-answering peer.

use rstest::rstest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dicom_client::{
    AbortReason, AbortSource, Association, AssociationParams, ClientEvent, ClientOptions,
    Connection, ConnectionEvent, Connector, Error, NegotiatedContext, Outcome, RejectReason,
    RejectResult, RejectSource, Rejection, Request, Response, StateKind, Status,
};

const VERIFICATION: &str = "1.2.840.10008.1.1";

/// How the scripted peer treats the association.
#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// accept and answer every request and the release
    Echo,
    /// reject the association request
    Reject(Rejection),
    /// accept, then never answer anything again
    Mute,
}

/// A peer which answers from inside the connection itself:
/// every outbound intent is immediately met with the scripted reaction.
struct ScriptedScp {
    behavior: Behavior,
    events: mpsc::Sender<ConnectionEvent>,
}

impl ScriptedScp {
    async fn emit(&self, event: ConnectionEvent) {
        self.events.send(event).await.expect("event stream closed");
    }
}

impl Connection for ScriptedScp {
    async fn connect(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    async fn send_association_request(
        &mut self,
        params: &AssociationParams,
    ) -> std::io::Result<()> {
        match self.behavior {
            Behavior::Echo | Behavior::Mute => {
                let contexts = params
                    .presentation_contexts
                    .iter()
                    .enumerate()
                    .map(|(i, proposed)| NegotiatedContext {
                        id: (2 * i + 1) as u8,
                        abstract_syntax: proposed.abstract_syntax.clone(),
                        transfer_syntax: proposed.transfer_syntaxes[0].clone(),
                    })
                    .collect();
                self.emit(ConnectionEvent::AssociationAccepted {
                    association: Association {
                        peer_ae_title: params.called_ae_title.to_string(),
                        presentation_contexts: contexts,
                        peer_max_pdu_length: params.max_pdu_length,
                    },
                })
                .await;
            }
            Behavior::Reject(rejection) => {
                self.emit(ConnectionEvent::AssociationRejected { rejection })
                    .await;
            }
        }
        Ok(())
    }

    async fn send_request(&mut self, request: Request) -> std::io::Result<()> {
        if let Behavior::Echo = self.behavior {
            self.emit(ConnectionEvent::RequestCompleted {
                message_id: request.message_id,
                response: Response {
                    status: Status::Success,
                    data: None,
                },
            })
            .await;
            self.emit(ConnectionEvent::SendQueueEmpty).await;
        }
        Ok(())
    }

    async fn send_association_release(&mut self) -> std::io::Result<()> {
        if let Behavior::Echo = self.behavior {
            self.emit(ConnectionEvent::ReleaseResponse).await;
        }
        Ok(())
    }

    async fn send_abort(
        &mut self,
        _source: AbortSource,
        _reason: AbortReason,
    ) -> std::io::Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) {}
}

struct ScriptedConnector {
    behavior: Behavior,
}

impl Connector for ScriptedConnector {
    type Connection = ScriptedScp;

    fn open(
        &self,
        _params: &AssociationParams,
    ) -> (ScriptedScp, mpsc::Receiver<ConnectionEvent>) {
        let (events, rx) = mpsc::channel(32);
        (
            ScriptedScp {
                behavior: self.behavior,
                events,
            },
            rx,
        )
    }
}

fn client_against(behavior: Behavior) -> dicom_client::Client<ScriptedConnector> {
    ClientOptions::new()
        .calling_ae_title("LIFECYCLE-SCU")
        .called_ae_title("LIFECYCLE-SCP")
        .host("127.0.0.1")
        .port(11112)
        .with_abstract_syntax(VERIFICATION)
        .build(ScriptedConnector { behavior })
}

fn echo_request(message_id: u16) -> Request {
    Request::new(message_id, VERIFICATION, &b"\x30\x00"[..])
}

#[tokio::test(start_paused = true)]
async fn verification_roundtrip() {
    let client = client_against(Behavior::Echo);
    let responses = client.add_request(echo_request(1));

    let outcome = client.send(CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, Outcome::ReleasedCleanly));

    let response = responses.finished().await.unwrap();
    assert_eq!(response.status, Status::Success);
    assert_eq!(client.state(), StateKind::Completed);
    assert_eq!(client.queued_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_send_is_a_clean_no_op() {
    let client = client_against(Behavior::Echo);
    let outcome = client.send(CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, Outcome::ReleasedCleanly));
}

#[rstest]
#[case::permanent(RejectResult::Permanent, RejectReason::CalledAeTitleNotRecognized)]
#[case::transient(RejectResult::Transient, RejectReason::TemporaryCongestion)]
#[tokio::test(start_paused = true)]
async fn rejected_association_surfaces_the_rejection(
    #[case] result: RejectResult,
    #[case] reason: RejectReason,
) {
    let rejection = Rejection {
        result,
        source: RejectSource::ServiceProviderPresentation,
        reason,
    };
    let client = client_against(Behavior::Reject(rejection));
    client.add_request(echo_request(1));

    let error = client.send(CancellationToken::new()).await.unwrap_err();
    match error {
        Error::Rejected { rejection: got, .. } => assert_eq!(got, rejection),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn abort_tears_down_a_mute_association() {
    let client = client_against(Behavior::Mute);
    let mut events = client.subscribe();
    client.add_request(echo_request(1));

    let aborter = async {
        // wait until the request is in flight
        loop {
            if let Ok(ClientEvent::StateChanged {
                new: StateKind::Sending,
                ..
            }) = events.recv().await
            {
                break;
            }
        }
        client.abort().await;
    };

    let (outcome, ()) = tokio::join!(client.send(CancellationToken::new()), aborter);
    assert!(matches!(outcome, Err(Error::Aborted { .. })));
    assert_eq!(client.state(), StateKind::Completed);
}

#[tokio::test(start_paused = true)]
async fn client_runs_two_lifecycles_back_to_back() {
    let client = client_against(Behavior::Echo);

    for id in [1u16, 2] {
        let responses = client.add_request(echo_request(id));
        client.send(CancellationToken::new()).await.unwrap();
        let response = responses.finished().await.unwrap();
        assert_eq!(response.status, Status::Success);
    }
}
