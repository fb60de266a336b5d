//! Relay-Connection – Verwaltet eine einzelne TCP-Verbindung
//!
//! Jede TCP-Verbindung laeuft in zwei tokio-Tasks.
//!
//! ## Ablauf
//! ```text
//! Verbunden --Hello--> Angemeldet (Registry + Schluessel + Send-Queue) --> Trennung
//! ```
//!
//! Der erste Frame muss `Hello` sein. Danach wird der Socket geteilt:
//! der Lese-Task verarbeitet Client-Frames, der Schreib-Task leert Antworten
//! und die Send-Queue auf den Socket. Ein `publish` des Lese-Tasks wartet
//! dadurch nie auf die eigene, nur von ihm selbst geleerte Queue.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use kurier_core::types::{ConnectionId, HandshakeId, IdentityId};
use kurier_crypto::EnvelopeCodec;
use kurier_protocol::{ClientFrame, Envelope, ErrorCode, ServerCodec, ServerFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::archive::ArchivedEnvelope;
use crate::error::{RelayError, RelayResult};
use crate::router::Delivery;
use crate::state::RelayState;

type RelayFramed = Framed<TcpStream, ServerCodec>;
type FrameSink = SplitSink<RelayFramed, ServerFrame>;
type FrameStream = SplitStream<RelayFramed>;

/// Antworten des Lese-Tasks, die auf den Schreib-Task warten
const ANTWORT_KAPAZITAET: usize = 64;

/// So lange darf der Schreib-Task nach dem Ende des Lese-Tasks noch leeren
const SCHREIBER_NACHLAUF: Duration = Duration::from_secs(5);

/// Geschaetzter Overhead pro Envelope im Wire-Format (Header, Nonce, Tag)
const ENVELOPE_OVERHEAD: usize = 128;

/// Verarbeitet eine einzelne TCP-Verbindung
pub struct RelayConnection {
    state: Arc<RelayState>,
    peer_addr: SocketAddr,
}

impl RelayConnection {
    pub fn neu(state: Arc<RelayState>, peer_addr: SocketAddr) -> Self {
        Self { state, peer_addr }
    }

    /// Startet die Verbindungs-Verarbeitung
    ///
    /// Laeuft bis die Verbindung getrennt wird oder ein Shutdown-Signal eingeht.
    pub async fn verarbeiten(self, stream: TcpStream, mut shutdown_rx: watch::Receiver<bool>) {
        let peer_addr = self.peer_addr;
        tracing::info!(peer = %peer_addr, "Neue Verbindung");

        let codec = ServerCodec::with_max_size(self.state.config.max_frame_bytes);
        let mut framed = Framed::new(stream, codec);

        let (identity_id, token) = match self.hello_abwarten(&mut framed, &mut shutdown_rx).await {
            Ok(Some(anmeldung)) => anmeldung,
            Ok(None) => {
                tracing::debug!(peer = %peer_addr, "Verbindung vor Hello beendet");
                return;
            }
            Err(e) => {
                tracing::warn!(peer = %peer_addr, fehler = %e, "Anmeldung fehlgeschlagen");
                let _ = framed.send(fehler_frame(None, e)).await;
                return;
            }
        };

        let registry = &self.state.registry;
        let connection_id = registry.connect(identity_id, HandshakeId::new());
        let Some(cancel) = registry.cancellation(connection_id) else {
            return;
        };
        let zustellungen = self.state.router.attach(connection_id);

        let geoeffnet = self.state.keys.oeffnen(identity_id, &token, &cancel).await;
        drop(token);
        if let Err(e) = geoeffnet {
            tracing::error!(identity = %identity_id, fehler = %e, "Schluessel-Sitzung konnte nicht geoeffnet werden");
            let _ = framed.send(fehler_frame(None, e)).await;
            self.abmelden(connection_id, identity_id).await;
            return;
        }

        let willkommen = ServerFrame::Welcome {
            connection_id,
            identity_id,
        };
        if let Err(e) = framed.send(willkommen).await {
            tracing::warn!(peer = %peer_addr, fehler = %e, "Welcome konnte nicht gesendet werden");
            self.abmelden(connection_id, identity_id).await;
            return;
        }
        tracing::info!(
            peer = %peer_addr,
            connection = %connection_id,
            identity = %identity_id,
            "Verbindung angemeldet"
        );

        let (sink, stream) = framed.split();
        let (antwort_tx, antwort_rx) = mpsc::channel(ANTWORT_KAPAZITAET);
        let mut schreiber = tokio::spawn(schreiben(
            sink,
            antwort_rx,
            zustellungen,
            cancel.clone(),
            peer_addr,
        ));

        self.lesen(
            stream,
            &antwort_tx,
            connection_id,
            identity_id,
            &cancel,
            &mut shutdown_rx,
        )
        .await;

        // Send-Queue schliessen, dann leert der Schreib-Task den Rest
        self.state.router.disconnect(connection_id).await;
        self.state.router.detach(connection_id);
        drop(antwort_tx);
        if tokio::time::timeout(SCHREIBER_NACHLAUF, &mut schreiber)
            .await
            .is_err()
        {
            tracing::warn!(peer = %peer_addr, "Schreib-Task haengt, wird abgebrochen");
            schreiber.abort();
        }

        self.state.keys.schliessen(identity_id).await;
        tracing::info!(peer = %peer_addr, connection = %connection_id, "Verbindungs-Task beendet");
    }

    /// Cleanup fuer Verbindungen, die nie in die Schleife kamen
    async fn abmelden(&self, connection_id: ConnectionId, identity_id: IdentityId) {
        self.state.router.disconnect(connection_id).await;
        self.state.keys.schliessen(identity_id).await;
    }

    async fn lesen(
        &self,
        mut stream: FrameStream,
        antworten: &mpsc::Sender<ServerFrame>,
        connection_id: ConnectionId,
        identity_id: IdentityId,
        cancel: &CancellationToken,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let peer_addr = self.peer_addr;
        let leerlauf = self.state.config.leerlauf_timeout;
        let mut letzter_empfang = Instant::now();

        loop {
            tokio::select! {
                // Eingehender Frame vom Client
                frame = stream.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            letzter_empfang = Instant::now();
                            let Some(antwort) = self
                                .frame_verarbeiten(connection_id, identity_id, cancel, frame)
                                .await
                            else {
                                continue;
                            };
                            let gesendet = tokio::select! {
                                biased;
                                ergebnis = antworten.send(antwort) => ergebnis.is_ok(),
                                _ = cancel.cancelled() => false,
                            };
                            if !gesendet {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(peer = %peer_addr, fehler = %e, "Frame-Lesefehler");
                            break;
                        }
                        None => {
                            tracing::info!(peer = %peer_addr, "Verbindung vom Client getrennt");
                            break;
                        }
                    }
                }

                _ = tokio::time::sleep_until(letzter_empfang + leerlauf) => {
                    tracing::warn!(peer = %peer_addr, "Verbindungs-Timeout");
                    break;
                }

                // Serverseitig getrennt (Registry) oder Schreib-Task ausgefallen
                _ = cancel.cancelled() => {
                    tracing::info!(peer = %peer_addr, "Verbindung serverseitig getrennt");
                    break;
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!(peer = %peer_addr, "Shutdown-Signal, Verbindung wird getrennt");
                        let abschied = ServerFrame::error(
                            None,
                            ErrorCode::InternalError,
                            "Server wird heruntergefahren",
                        );
                        let _ = antworten.try_send(abschied);
                        break;
                    }
                }
            }
        }
    }

    /// Wartet auf den `Hello`-Frame und verifiziert die Identitaet
    ///
    /// Liefert Identitaet und Token (Credential fuer den versiegelten
    /// Schluessel). `Ok(None)` wenn der Client vorher auflegt oder der Server
    /// herunterfaehrt.
    async fn hello_abwarten(
        &self,
        framed: &mut RelayFramed,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> RelayResult<Option<(IdentityId, Zeroizing<String>)>> {
        let frist = self.state.config.hello_timeout;
        let frame = tokio::select! {
            frame = tokio::time::timeout(frist, framed.next()) => frame,
            Ok(()) = shutdown_rx.changed() => return Ok(None),
        };

        match frame {
            Err(_) => Err(RelayError::NichtAuthentifiziert(
                "Kein Hello innerhalb der Frist".into(),
            )),
            Ok(None) => Ok(None),
            Ok(Some(Err(e))) => Err(RelayError::Io(e)),
            Ok(Some(Ok(ClientFrame::Hello { identity_id, token }))) => {
                let token = Zeroizing::new(token);
                let identity_id = self.state.verifier.verify(identity_id, &token)?;
                Ok(Some((identity_id, token)))
            }
            Ok(Some(Ok(_))) => Err(RelayError::NichtAuthentifiziert(
                "Erster Frame muss Hello sein".into(),
            )),
        }
    }

    /// Verarbeitet einen Frame eines angemeldeten Clients
    ///
    /// Gibt die Antwort zurueck, falls der Frame eine erfordert.
    async fn frame_verarbeiten(
        &self,
        connection_id: ConnectionId,
        identity_id: IdentityId,
        cancel: &CancellationToken,
        frame: ClientFrame,
    ) -> Option<ServerFrame> {
        let router = &self.state.router;
        match frame {
            ClientFrame::Hello { .. } => Some(fehler_frame(
                None,
                RelayError::protokoll("Verbindung ist bereits angemeldet"),
            )),

            ClientFrame::Join { room_id } => match router.join(connection_id, &room_id).await {
                Ok(_) => None,
                Err(e) => Some(fehler_frame(None, e)),
            },

            ClientFrame::Leave { room_id } => match router.leave(connection_id, &room_id).await {
                Ok(_) => None,
                Err(e) => Some(fehler_frame(None, e)),
            },

            ClientFrame::Publish {
                request_id,
                room_id,
                envelope,
            } => {
                if envelope.sender_id != identity_id {
                    tracing::warn!(
                        connection = %connection_id,
                        identity = %identity_id,
                        absender = %envelope.sender_id,
                        "Envelope mit fremdem Absender abgelehnt"
                    );
                    return Some(fehler_frame(
                        Some(request_id),
                        RelayError::protokoll("Absender passt nicht zur angemeldeten Identitaet"),
                    ));
                }
                if !self.state.registry.ist_mitglied(connection_id, &room_id) {
                    return Some(fehler_frame(
                        Some(request_id),
                        RelayError::protokoll(format!("Nicht Mitglied von {room_id}")),
                    ));
                }

                let receipt = router.publish(&room_id, envelope).await;
                Some(ServerFrame::Receipt {
                    request_id,
                    receipt,
                })
            }

            ClientFrame::PublicKeyRequest {
                request_id,
                identity_id: gesucht,
            } => match self.state.custody.get_public_key(gesucht) {
                Ok(public) => Some(ServerFrame::PublicKey {
                    request_id,
                    identity_id: gesucht,
                    public_key_der: STANDARD.encode(public.as_der()),
                }),
                Err(e) => Some(fehler_frame(Some(request_id), e.into())),
            },

            ClientFrame::Decrypt {
                request_id,
                envelope,
            } => Some(
                match self.entschluesseln(identity_id, cancel, envelope).await {
                    Ok(plaintext) => ServerFrame::Decrypted {
                        request_id,
                        plaintext,
                    },
                    Err(e) => fehler_frame(Some(request_id), e),
                },
            ),

            ClientFrame::History {
                request_id,
                room_id,
                limit,
            } => {
                if !self.state.registry.ist_mitglied(connection_id, &room_id) {
                    return Some(fehler_frame(
                        Some(request_id),
                        RelayError::protokoll(format!("Nicht Mitglied von {room_id}")),
                    ));
                }
                let limit = (limit as usize).min(self.state.config.max_history);
                let archiviert = router.archive().history(&room_id, limit);
                let envelopes = history_auswaehlen(archiviert, self.state.config.max_frame_bytes / 2);
                Some(ServerFrame::History {
                    request_id,
                    room_id,
                    envelopes,
                })
            }

            ClientFrame::Ping { request_id } => Some(ServerFrame::Pong { request_id }),
        }
    }

    /// Entschluesselt ein an die eigene Identitaet adressiertes Envelope
    ///
    /// Laeuft im Krypto-Worker und bricht ab, sobald die Verbindung getrennt
    /// wird.
    async fn entschluesseln(
        &self,
        identity_id: IdentityId,
        cancel: &CancellationToken,
        envelope: Envelope,
    ) -> RelayResult<String> {
        if envelope.receiver_id != identity_id {
            return Err(RelayError::protokoll(
                "Envelope ist nicht an die angemeldete Identitaet adressiert",
            ));
        }

        let custody = self.state.custody.clone();
        let klartext = self
            .state
            .worker
            .ausfuehren(cancel, move || {
                EnvelopeCodec::default()
                    .decrypt(&custody, identity_id, &envelope)
                    .map(Zeroizing::new)
            })
            .await?;
        Ok(STANDARD.encode(klartext.as_slice()))
    }
}

/// Schreib-Task: leert Antworten und Send-Queue auf den Socket
///
/// Endet, wenn beide Queues geschlossen und leer sind. Ein Schreibfehler
/// trennt die Verbindung ueber das Cancellation-Token.
async fn schreiben(
    mut sink: FrameSink,
    mut antworten: mpsc::Receiver<ServerFrame>,
    mut zustellungen: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
    peer_addr: SocketAddr,
) {
    loop {
        let frame = tokio::select! {
            Some(antwort) = antworten.recv() => antwort,
            Some(zustellung) = zustellungen.recv() => zustellung_frame(zustellung),
            else => break,
        };
        if let Err(e) = sink.send(frame).await {
            tracing::warn!(peer = %peer_addr, fehler = %e, "Senden an Socket fehlgeschlagen");
            cancel.cancel();
            return;
        }
    }
    let _ = sink.close().await;
}

fn zustellung_frame(zustellung: Delivery) -> ServerFrame {
    match zustellung {
        Delivery::Envelope { room_id, envelope } => ServerFrame::Receive {
            room_id,
            envelope: envelope.as_ref().clone(),
        },
        Delivery::Control { room_id, event } => ServerFrame::Control { room_id, event },
    }
}

/// Neueste Envelopes, bis das Byte-Budget erschoepft ist; aelteste zuerst
fn history_auswaehlen(archiviert: Vec<ArchivedEnvelope>, budget: usize) -> Vec<Envelope> {
    let mut verbraucht = 0usize;
    let mut auswahl: Vec<Envelope> = archiviert
        .iter()
        .rev()
        .take_while(|a| {
            let roh = a.envelope.ciphertext.len() + a.envelope.wrapped_key.len() + ENVELOPE_OVERHEAD;
            // Base64 braucht 4 Zeichen pro 3 Bytes
            verbraucht += roh.div_ceil(3) * 4;
            verbraucht <= budget
        })
        .map(|a| a.envelope.as_ref().clone())
        .collect();
    auswahl.reverse();
    auswahl
}

fn fehler_frame(request_id: Option<u32>, fehler: RelayError) -> ServerFrame {
    ServerFrame::error(request_id, fehler.error_code(), fehler.to_string())
}
